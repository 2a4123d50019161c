//! Key extraction: the map stage of a count job.

use crate::api::Mapper;
use crate::error::{Error, Result};
use crate::record::{Row, Value};
use regex::Regex;

/// What to do when a field the extractor needs is absent or null.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MissingPolicy {
    #[default]
    Fail,
    Skip,
}

/// How the key is derived from the key field's text.
#[derive(Clone, Debug)]
pub enum KeySelector {
    /// The whole field value.
    Field,
    /// The first match of the pattern, or its capture group 1 when the
    /// pattern has groups. Records where that text did not match are not
    /// counted.
    FirstMatch(Regex),
    /// One contribution per match, e.g. every hashtag of a tweet.
    AllMatches(Regex),
}

/// Applicability predicate: `field` must match `pattern`.
#[derive(Clone, Debug)]
pub struct FieldFilter {
    pub field: String,
    pub pattern: Regex,
}

/// Configurable extractor counting one field of each record.
#[derive(Clone, Debug)]
pub struct FieldExtractor {
    key_field: String,
    selector: KeySelector,
    filter: Option<FieldFilter>,
    on_missing: MissingPolicy,
    lowercase: bool,
}

impl FieldExtractor {
    pub fn new(key_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
            selector: KeySelector::Field,
            filter: None,
            on_missing: MissingPolicy::Fail,
            lowercase: false,
        }
    }

    /// Counts tweets per user.
    pub fn tweet_usernames() -> Self {
        Self::new("username")
    }

    pub fn with_selector(mut self, selector: KeySelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_filter(mut self, field: impl Into<String>, pattern: Regex) -> Self {
        self.filter = Some(FieldFilter { field: field.into(), pattern });
        self
    }

    pub fn on_missing(mut self, policy: MissingPolicy) -> Self {
        self.on_missing = policy;
        self
    }

    pub fn lowercase(mut self, yes: bool) -> Self {
        self.lowercase = yes;
        self
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// Looks up `name`; `Ok(None)` means the record is skipped under the
    /// missing-field policy.
    fn lookup<'a>(&self, record: &'a Row, name: &str) -> Result<Option<&'a Value>> {
        match record.get(name) {
            Some(v) if !v.is_null() => Ok(Some(v)),
            _ => match self.on_missing {
                MissingPolicy::Skip => Ok(None),
                MissingPolicy::Fail => Err(Error::extraction(record, format!("field '{name}' is missing"))),
            },
        }
    }

    fn applies(&self, record: &Row) -> Result<bool> {
        let Some(filter) = &self.filter else { return Ok(true) };
        let Some(value) = self.lookup(record, &filter.field)? else { return Ok(false) };
        let text = key_text(record, &filter.field, value)?;
        Ok(filter.pattern.is_match(&text))
    }

    fn normalize(&self, key: &str) -> String {
        if self.lowercase {
            key.to_lowercase()
        } else {
            key.to_string()
        }
    }

    /// Keys contributed by one record, in emission order.
    pub fn keys(&self, record: &Row) -> Result<Vec<String>> {
        if !self.applies(record)? {
            return Ok(Vec::new());
        }
        let Some(value) = self.lookup(record, &self.key_field)? else { return Ok(Vec::new()) };
        let text = key_text(record, &self.key_field, value)?;
        let keys = match &self.selector {
            KeySelector::Field => vec![self.normalize(&text)],
            KeySelector::FirstMatch(re) => match re.captures(&text) {
                Some(caps) => {
                    let group = if re.captures_len() > 1 { 1 } else { 0 };
                    caps.get(group).map(|m| vec![self.normalize(m.as_str())]).unwrap_or_default()
                }
                None => Vec::new(),
            },
            KeySelector::AllMatches(re) => re.find_iter(&text).map(|m| self.normalize(m.as_str())).collect(),
        };
        Ok(keys)
    }
}

fn key_text(record: &Row, field: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Int32(i) => Ok(i.to_string()),
        Value::Int64(i) => Ok(i.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(Error::extraction(record, format!("field '{field}' holds {other}, which cannot be a key"))),
    }
}

impl Mapper for FieldExtractor {
    type Input = Row;
    type Key = String;
    type Value = i32;

    fn do_map<F>(&self, input: &Self::Input, emit: &mut F) -> Result<()>
    where
        F: FnMut(Self::Key, Self::Value),
    {
        for key in self.keys(input)? {
            emit(key, 1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Tweet;

    fn tweet(user: &str, text: &str) -> Row {
        Tweet { username: user.into(), tweet: text.into(), timestamp: 0 }.into()
    }

    fn collect(ex: &FieldExtractor, row: &Row) -> Result<Vec<(String, i32)>> {
        let mut out = Vec::new();
        ex.do_map(row, &mut |k, v| out.push((k, v)))?;
        Ok(out)
    }

    #[test]
    fn username_extractor_emits_one_contribution() {
        let out = collect(&FieldExtractor::tweet_usernames(), &tweet("miguno", "hello")).unwrap();
        assert_eq!(out, vec![("miguno".to_string(), 1)]);
    }

    #[test]
    fn filter_mismatch_emits_nothing() {
        let ex = FieldExtractor::tweet_usernames().with_filter("tweet", Regex::new("(?i)rock").unwrap());
        assert!(collect(&ex, &tweet("a", "paper")).unwrap().is_empty());
        assert_eq!(collect(&ex, &tweet("a", "Rock on")).unwrap().len(), 1);
    }

    #[test]
    fn missing_key_field_fails_unless_skipped() {
        let mut row = tweet("a", "b");
        row.remove("username");
        let err = collect(&FieldExtractor::tweet_usernames(), &row).unwrap_err();
        assert!(matches!(err, Error::Extraction { .. }));

        let skip = FieldExtractor::tweet_usernames().on_missing(MissingPolicy::Skip);
        assert!(collect(&skip, &row).unwrap().is_empty());
    }

    #[test]
    fn double_keys_are_rejected() {
        let mut row = Row::new();
        row.insert("score".into(), Value::Double(1.5));
        let err = collect(&FieldExtractor::new("score"), &row).unwrap_err();
        assert!(matches!(err, Error::Extraction { reason, .. } if reason.contains("score")));
    }

    #[test]
    fn integer_fields_become_string_keys() {
        let mut row = Row::new();
        row.insert("id".into(), Value::Int64(42));
        assert_eq!(collect(&FieldExtractor::new("id"), &row).unwrap(), vec![("42".to_string(), 1)]);
    }

    #[test]
    fn first_match_prefers_capture_group() {
        let ex = FieldExtractor::new("tweet").with_selector(KeySelector::FirstMatch(Regex::new(r"@(\w+)").unwrap()));
        assert_eq!(collect(&ex, &tweet("a", "hi @BigData and @rust")).unwrap(), vec![("BigData".to_string(), 1)]);
        assert!(collect(&ex, &tweet("a", "no mentions")).unwrap().is_empty());
    }

    #[test]
    fn unmatched_optional_group_yields_no_key() {
        let ex = FieldExtractor::new("tweet").with_selector(KeySelector::FirstMatch(Regex::new(r"(a)?b").unwrap()));
        assert!(collect(&ex, &tweet("u", "b")).unwrap().is_empty());
        assert_eq!(collect(&ex, &tweet("u", "ab")).unwrap(), vec![("a".to_string(), 1)]);
    }

    #[test]
    fn all_matches_emits_per_match_and_lowercases() {
        let ex = FieldExtractor::new("tweet")
            .with_selector(KeySelector::AllMatches(Regex::new(r"#\w+").unwrap()))
            .lowercase(true);
        let out = collect(&ex, &tweet("a", "#Hadoop meets #avro and #hadoop")).unwrap();
        let keys: Vec<_> = out.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["#hadoop", "#avro", "#hadoop"]);
    }
}
