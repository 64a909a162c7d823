//! Subscription and filter parsing
use crate::event::Event;
use serde::de::Unexpected;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::collections::HashSet;

/// Subscription identifier and set of request filters
#[derive(Serialize, PartialEq, Eq, Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub filters: Vec<ReqFilter>,
}

/// Corresponds to a client's subscription filter, with each
/// present field interpreted as a conjunction of constraints.
#[derive(Serialize, PartialEq, Eq, Debug, Clone)]
pub struct ReqFilter {
    /// Event hashes, possibly as prefixes
    pub ids: Option<Vec<String>>,
    /// Event kinds
    pub kinds: Option<Vec<u16>>,
    /// Events published after this time
    pub since: Option<i64>,
    /// Events published before this time
    pub until: Option<i64>,
    /// List of author public keys, possibly as prefixes
    pub authors: Option<Vec<String>>,
    /// Limit number of results during the initial scan
    pub limit: Option<u64>,
    /// Set of tag value sets, keyed on the single-char tag name
    pub tags: Option<HashMap<char, HashSet<String>>>,
    /// Force no matches due to malformed data
    pub force_no_match: bool,
}

impl<'de> Deserialize<'de> for ReqFilter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let received: Value = Deserialize::deserialize(deserializer)?;
        let filter = received.as_object().ok_or_else(|| {
            serde::de::Error::invalid_type(
                Unexpected::Other("reqfilter"),
                &"a json object for a filter",
            )
        })?;
        let mut rf = ReqFilter {
            ids: None,
            kinds: None,
            since: None,
            until: None,
            authors: None,
            limit: None,
            tags: None,
            force_no_match: false,
        };
        let empty_string = "".into();
        let mut ts = None;
        // iterate through each key, and assign values that exist
        for (key, val) in filter {
            // ids
            if key == "ids" {
                let raw_ids: Option<Vec<String>> = Deserialize::deserialize(val).ok();
                if let Some(a) = raw_ids.as_ref() {
                    if a.contains(&empty_string) {
                        return Err(serde::de::Error::invalid_type(
                            Unexpected::Other("prefix matches must not be empty strings"),
                            &"a json object",
                        ));
                    }
                }
                rf.ids = raw_ids;
            } else if key == "kinds" {
                rf.kinds = Deserialize::deserialize(val).ok();
            } else if key == "since" {
                rf.since = Deserialize::deserialize(val).ok();
            } else if key == "until" {
                rf.until = Deserialize::deserialize(val).ok();
            } else if key == "limit" {
                rf.limit = Deserialize::deserialize(val).ok();
            } else if key == "authors" {
                let raw_authors: Option<Vec<String>> = Deserialize::deserialize(val).ok();
                if let Some(a) = raw_authors.as_ref() {
                    if a.contains(&empty_string) {
                        return Err(serde::de::Error::invalid_type(
                            Unexpected::Other("prefix matches must not be empty strings"),
                            &"a json object",
                        ));
                    }
                }
                rf.authors = raw_authors;
            } else if key.starts_with('#') && key.len() > 1 {
                // tag search of the form "#x": only single
                // alphanumeric tag names are indexed and searchable.
                let tag_search = tag_search_char_from_filter(key);
                if let Some(c) = tag_search {
                    if ts.is_none() {
                        // Initialize the tag if necessary
                        ts = Some(HashMap::new());
                    }
                    if let Some(m) = ts.as_mut() {
                        let tag_vals: Option<Vec<String>> = Deserialize::deserialize(val).ok();
                        if let Some(v) = tag_vals {
                            let hs = v.into_iter().collect::<HashSet<_>>();
                            m.insert(c, hs);
                        }
                    };
                } else {
                    // tag search that is multi-character, don't add to subscription
                    rf.force_no_match = true;
                    continue;
                }
            }
        }
        rf.tags = ts;
        Ok(rf)
    }
}

/// Attempt to form a single-char identifier from a tag search filter
fn tag_search_char_from_filter(tagname: &str) -> Option<char> {
    let tagname_nohash = &tagname[1..];
    // We return the tag character if and only if the tagname consists
    // of a single char.
    let mut tagnamechars = tagname_nohash.chars();
    let firstchar = tagnamechars.next();
    match firstchar {
        Some(_) => {
            // check second char
            if tagnamechars.next().is_none() {
                firstchar.filter(|f| f.is_alphanumeric())
            } else {
                None
            }
        }
        None => None,
    }
}

impl<'de> Deserialize<'de> for Subscription {
    /// Custom deserializer for subscriptions, which have a more
    /// complex structure than the other message types.
    fn deserialize<D>(deserializer: D) -> Result<Subscription, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut v: Value = Deserialize::deserialize(deserializer)?;
        // this should be a 3-or-more element array.
        // verify the first element is a String, REQ
        // get the subscription from the second element.
        // convert each of the remaining objects into filters

        // check for array
        let va = v
            .as_array_mut()
            .ok_or_else(|| serde::de::Error::custom("not array"))?;

        // check length
        if va.len() < 3 {
            return Err(serde::de::Error::custom("not enough fields"));
        }
        let mut i = va.iter_mut();
        // get command ("REQ") and ensure it is a string
        let req_cmd_str: Value = i.next().unwrap().take();
        let req = req_cmd_str
            .as_str()
            .ok_or_else(|| serde::de::Error::custom("first element of request was not a string"))?;
        if req != "REQ" {
            return Err(serde::de::Error::custom("missing REQ command"));
        }

        // ensure sub id is a string
        let sub_id_str: Value = i.next().unwrap().take();
        let sub_id = sub_id_str
            .as_str()
            .ok_or_else(|| serde::de::Error::custom("missing subscription id"))?;

        let mut filters = vec![];
        for fv in i {
            let f: ReqFilter = serde_json::from_value(fv.take())
                .map_err(|_| serde::de::Error::custom("could not parse filter"))?;
            // create indexes
            filters.push(f);
        }
        filters.dedup();
        Ok(Subscription {
            id: sub_id.to_owned(),
            filters,
        })
    }
}

impl Subscription {
    /// Get a copy of the subscription identifier.
    #[must_use]
    pub fn get_id(&self) -> String {
        self.id.clone()
    }

    /// Determine if any filter is requesting historical (stored)
    /// events from the relay (`limit: 0` disables the initial scan).
    #[must_use]
    pub fn needs_historical_events(&self) -> bool {
        self.filters.iter().any(|f| f.limit != Some(0))
    }

    /// Determine if this subscription matches a given [`Event`].  Any
    /// individual filter match is sufficient.
    #[must_use]
    pub fn interested_in_event(&self, event: &Event) -> bool {
        for f in &self.filters {
            if f.interested_in_event(event) {
                return true;
            }
        }
        false
    }
}

fn prefix_match(prefixes: &[String], target: &str) -> bool {
    for prefix in prefixes {
        if target.starts_with(prefix) {
            return true;
        }
    }
    // none matched
    false
}

impl ReqFilter {
    fn ids_match(&self, event: &Event) -> bool {
        self.ids
            .as_ref()
            .map_or(true, |vs| prefix_match(vs, &event.id))
    }

    fn authors_match(&self, event: &Event) -> bool {
        self.authors
            .as_ref()
            .map_or(true, |vs| prefix_match(vs, &event.pubkey))
    }

    fn tag_match(&self, event: &Event) -> bool {
        // get the hashset from the filter.
        if let Some(map) = &self.tags {
            for (key, val) in map.iter() {
                let tag_match = event.generic_tag_val_intersect(*key, val);
                // if there is no match for this tag, the match fails.
                if !tag_match {
                    return false;
                }
                // if there was a match, we move on to the next one.
            }
        }
        // if the tag map is empty, the match succeeds.
        true
    }

    /// Check if this filter either matches, or does not care about the kind.
    fn kind_match(&self, kind: u16) -> bool {
        self.kinds.as_ref().map_or(true, |ks| ks.contains(&kind))
    }

    /// Determine if all populated fields in this filter match the provided event.
    #[must_use]
    pub fn interested_in_event(&self, event: &Event) -> bool {
        self.ids_match(event)
            && self.since.map_or(true, |t| event.created_at >= t)
            && self.until.map_or(true, |t| event.created_at <= t)
            && self.kind_match(event.kind)
            && self.authors_match(event)
            && self.tag_match(event)
            && !self.force_no_match
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    fn simple_event() -> Event {
        Event {
            id: "0".repeat(64),
            pubkey: "0".repeat(64),
            created_at: 0,
            kind: 0,
            tags: vec![],
            content: "".to_owned(),
            sig: "0".repeat(128),
        }
    }

    #[test]
    fn req_parse_simple() -> Result<()> {
        let raw_json = r#"["REQ","some-id",{"kinds": [1]}]"#;
        let s: Subscription = serde_json::from_str(raw_json)?;
        assert_eq!(s.id, "some-id");
        assert_eq!(s.filters.len(), 1);
        let first_filter = s.filters.get(0).unwrap();
        assert_eq!(first_filter.kinds, Some(vec![1]));
        Ok(())
    }

    #[test]
    fn req_parse_multi_filters() -> Result<()> {
        let raw_json = r#"["REQ","some-id",{"kinds": [1]}, {"kinds": [2]}]"#;
        let s: Subscription = serde_json::from_str(raw_json)?;
        assert_eq!(s.id, "some-id");
        assert_eq!(s.filters.len(), 2);
        Ok(())
    }

    #[test]
    fn duplicate_filters_dedup() -> Result<()> {
        let raw_json = r#"["REQ","some-id",{"kinds": [1]}, {"kinds": [1]}]"#;
        let s: Subscription = serde_json::from_str(raw_json)?;
        assert_eq!(s.filters.len(), 1);
        Ok(())
    }

    #[test]
    fn legacy_filter() {
        // legacy field in filter is ignored, and does not poison the
        // rest of the filter.
        let raw_json = r#"["REQ","some-id",{"kind": 0}]"#;
        let s: Subscription = serde_json::from_str(raw_json).unwrap();
        assert!(!s.filters[0].force_no_match);
    }

    #[test]
    fn multi_char_tag_search_matches_nothing() {
        let raw_json = r##"["REQ","some-id",{"#xyz": ["a"]}]"##;
        let s: Subscription = serde_json::from_str(raw_json).unwrap();
        assert!(s.filters[0].force_no_match);
        assert!(!s.filters[0].interested_in_event(&simple_event()));
    }

    #[test]
    fn empty_prefix_rejected() {
        let raw_json = r#"["REQ","some-id",{"authors": [""]}]"#;
        let parse: Result<Subscription, _> = serde_json::from_str(raw_json);
        assert!(parse.is_err());
    }

    #[test]
    fn not_req_rejected() {
        let raw_json = r#"["CLOSE","some-id",{"kinds":[1]}]"#;
        let parse: Result<Subscription, _> = serde_json::from_str(raw_json);
        assert!(parse.is_err());
    }

    #[test]
    fn interest_id_prefix_match() -> Result<()> {
        let s: Subscription = serde_json::from_str(r#"["REQ","xyz",{"ids": ["00"]}]"#)?;
        let e = simple_event();
        assert!(s.interested_in_event(&e));
        Ok(())
    }

    #[test]
    fn interest_id_nomatch() -> Result<()> {
        let s: Subscription = serde_json::from_str(r#"["REQ","xyz",{"ids": ["ab"]}]"#)?;
        let e = simple_event();
        assert!(!s.interested_in_event(&e));
        Ok(())
    }

    #[test]
    fn interest_time_and_id() -> Result<()> {
        let s: Subscription =
            serde_json::from_str(r#"["REQ","xyz",{"ids": ["00"], "since": 1000}]"#)?;
        let mut e = simple_event();
        e.created_at = 50;
        assert!(!s.interested_in_event(&e));
        e.created_at = 2000;
        assert!(s.interested_in_event(&e));
        Ok(())
    }

    #[test]
    fn interest_until() -> Result<()> {
        let s: Subscription = serde_json::from_str(r#"["REQ","xyz",{"until": 1000}]"#)?;
        let mut e = simple_event();
        e.created_at = 500;
        assert!(s.interested_in_event(&e));
        e.created_at = 1001;
        assert!(!s.interested_in_event(&e));
        Ok(())
    }

    #[test]
    fn interest_author_prefix() -> Result<()> {
        let s: Subscription = serde_json::from_str(r#"["REQ","xyz",{"authors": ["00"]}]"#)?;
        let e = simple_event();
        assert!(s.interested_in_event(&e));
        Ok(())
    }

    #[test]
    fn interest_kinds() -> Result<()> {
        let s: Subscription = serde_json::from_str(r#"["REQ","xyz",{"kinds": [1,2,3]}]"#)?;
        let mut e = simple_event();
        e.kind = 2;
        assert!(s.interested_in_event(&e));
        e.kind = 4;
        assert!(!s.interested_in_event(&e));
        Ok(())
    }

    #[test]
    fn interest_tag_match() -> Result<()> {
        let s: Subscription = serde_json::from_str(r##"["REQ","xyz",{"#e": ["aaaa"]}]"##)?;
        let mut e = simple_event();
        e.tags = vec![vec!["e".to_owned(), "aaaa".to_owned()]];
        assert!(s.interested_in_event(&e));
        e.tags = vec![vec!["e".to_owned(), "bbbb".to_owned()]];
        assert!(!s.interested_in_event(&e));
        // tags on the event but none requested
        e.tags = vec![];
        assert!(!s.interested_in_event(&e));
        Ok(())
    }

    #[test]
    fn interest_multi_tag_conjunction() -> Result<()> {
        let s: Subscription =
            serde_json::from_str(r##"["REQ","xyz",{"#e": ["aaaa"], "#p": ["cccc"]}]"##)?;
        let mut e = simple_event();
        e.tags = vec![
            vec!["e".to_owned(), "aaaa".to_owned()],
            vec!["p".to_owned(), "cccc".to_owned()],
        ];
        assert!(s.interested_in_event(&e));
        // only one of the two tag conditions present
        e.tags = vec![vec!["e".to_owned(), "aaaa".to_owned()]];
        assert!(!s.interested_in_event(&e));
        Ok(())
    }

    #[test]
    fn no_historical_events_when_all_zero_limit() -> Result<()> {
        let s: Subscription = serde_json::from_str(r#"["REQ","xyz",{"limit": 0}]"#)?;
        assert!(!s.needs_historical_events());
        let s: Subscription = serde_json::from_str(r#"["REQ","xyz",{"limit": 0},{"limit": 5}]"#)?;
        assert!(s.needs_historical_events());
        Ok(())
    }
}
