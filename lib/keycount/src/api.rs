use crate::error::Result;
use serde::{de::DeserializeOwned, Serialize};

// ========== Core MapReduce traits ==========

/// Map stage. Called once per input record; may emit zero or more
/// `(key, value)` contributions. Implementations must be pure functions of
/// the record so that any task may run on any thread, or run again.
///
/// Keys are grouped by their bincode encoding, so equal keys must encode to
/// equal bytes.
pub trait Mapper {
    type Input: Send + 'static;
    type Key: Send + Serialize + DeserializeOwned + Eq + Clone + 'static;
    type Value: Send + Serialize + DeserializeOwned + Clone + 'static;

    fn do_map<F>(&self, input: &Self::Input, emit: &mut F) -> Result<()>
    where
        F: FnMut(Self::Key, Self::Value);
}

/// Reduce stage. Called exactly once per distinct key, after every map task
/// has finished, with all values emitted for that key in no particular order.
pub trait Reducer {
    type Key: Send + Serialize + DeserializeOwned + Eq + Clone + 'static;
    type ValueIn: Send + Serialize + DeserializeOwned + Clone + 'static;
    type Out: Send + 'static;

    fn do_reduce<I, F>(&self, key: &Self::Key, values: I, emit: &mut F) -> Result<()>
    where
        I: IntoIterator<Item = Self::ValueIn>,
        F: FnMut(Self::Out);
}
