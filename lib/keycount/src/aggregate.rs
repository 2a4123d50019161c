use crate::api::Reducer;
use crate::error::{Error, Result};
use crate::record::OutputPair;

/// Sums the contributions of one key. Summation is order-independent, which
/// is what lets groups arrive in any interleaving of map output.
#[derive(Clone, Copy, Debug, Default)]
pub struct CountReducer;

impl Reducer for CountReducer {
    type Key = String;
    type ValueIn = i32;
    type Out = OutputPair;

    fn do_reduce<I, F>(&self, key: &Self::Key, values: I, emit: &mut F) -> Result<()>
    where
        I: IntoIterator<Item = Self::ValueIn>,
        F: FnMut(Self::Out),
    {
        let mut total: i32 = 0;
        for v in values {
            total = total
                .checked_add(v)
                .ok_or_else(|| Error::AggregationOverflow { key: key.clone() })?;
        }
        emit(OutputPair::new(key.clone(), total));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reduce(key: &str, values: Vec<i32>) -> Result<Vec<OutputPair>> {
        let mut out = Vec::new();
        CountReducer.do_reduce(&key.to_string(), values, &mut |p| out.push(p))?;
        Ok(out)
    }

    #[test]
    fn emits_exactly_one_pair_with_the_sum() {
        assert_eq!(reduce("x", vec![1, 1, 1]).unwrap(), vec![OutputPair::new("x", 3)]);
    }

    #[test]
    fn overflow_is_reported_not_wrapped() {
        let err = reduce("hot", vec![i32::MAX, 1]).unwrap_err();
        assert!(matches!(err, Error::AggregationOverflow { key } if key == "hot"));
    }

    #[test]
    fn order_of_values_does_not_matter() {
        let a = reduce("k", vec![5, 1, 7]).unwrap();
        let b = reduce("k", vec![7, 5, 1]).unwrap();
        assert_eq!(a, b);
    }
}
