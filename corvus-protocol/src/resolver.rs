//! Graph reference resolution for fetch-plan result sets.
//!
//! A fetch plan makes the server return a primary record together with
//! a flat list of companion records it links to. Resolution rewrites
//! link fields whose target is present in the companion set into live
//! shared references, producing one connected (possibly cyclic) graph:
//! a companion referenced from several places is the same instance
//! everywhere, and cycles terminate through a visited set keyed by
//! record id.

use crate::rid::RecordId;
use crate::value::{Document, SharedRecord, Value};
use std::collections::{HashMap, HashSet};

/// Resolves a primary record against its companions.
///
/// The primary itself participates in the index when it carries a
/// record id, so self-links and cycles through the primary resolve to
/// the primary instance. Links whose target is not among the
/// companions are left as plain [`Value::Link`]s.
pub fn resolve(primary: Document, companions: Vec<Document>) -> SharedRecord {
    let mut resolved = resolve_all(vec![primary], companions);
    resolved.pop().expect("one primary in, one record out")
}

/// Resolves several primary records against one shared companion set.
///
/// All primaries see the same companion instances, so identity is
/// preserved across results (the same record referenced from two query
/// results is one object).
pub fn resolve_all(primaries: Vec<Document>, companions: Vec<Document>) -> Vec<SharedRecord> {
    let companions: Vec<SharedRecord> =
        companions.into_iter().map(Document::into_shared).collect();
    let primaries: Vec<SharedRecord> =
        primaries.into_iter().map(Document::into_shared).collect();

    let mut index: HashMap<RecordId, SharedRecord> = HashMap::new();
    for companion in &companions {
        if let Some(rid) = companion.read().rid() {
            index.insert(rid, companion.clone());
        }
    }
    for primary in &primaries {
        if let Some(rid) = primary.read().rid() {
            index.entry(rid).or_insert_with(|| primary.clone());
        }
    }

    // Companions first, so cross-references among them are rewritten
    // before any primary is walked.
    let mut seen = HashSet::new();
    for companion in &companions {
        walk(companion, &index, &mut seen);
    }
    for primary in &primaries {
        walk(primary, &index, &mut seen);
    }

    primaries
}

fn walk(record: &SharedRecord, index: &HashMap<RecordId, SharedRecord>, seen: &mut HashSet<RecordId>) {
    // Cycle guard: one traversal per distinct record id.
    if let Some(rid) = record.read().rid() {
        if !seen.insert(rid) {
            return;
        }
    }

    let mut doc = record.write();
    for (_, value) in doc.fields_mut() {
        resolve_value(value, index);
    }
}

fn resolve_value(value: &mut Value, index: &HashMap<RecordId, SharedRecord>) {
    match value {
        // Replacement clones the Arc and never descends into the
        // target; targets are walked in their own pass, which also
        // keeps at most one record lock held at a time.
        Value::Link(rid) => {
            if let Some(target) = index.get(rid) {
                *value = Value::Record(target.clone());
            }
        }
        Value::List(items) => resolve_list(items, index),
        Value::Embedded(doc) => {
            for (_, nested) in doc.fields_mut() {
                resolve_value(nested, index);
            }
        }
        Value::Map(entries) => {
            for (_, nested) in entries {
                resolve_value(nested, index);
            }
        }
        _ => {}
    }
}

/// Link lists carry a historical edge case: once any link in the list
/// resolves, unresolved raw links are dropped from the list (earlier
/// client generations cleared the collection before appending the
/// resolved records, and servers rely on it). Lists with no resolvable
/// link are untouched, and non-link elements always survive and are
/// recursed into.
fn resolve_list(items: &mut Vec<Value>, index: &HashMap<RecordId, SharedRecord>) {
    let any_resolved = items
        .iter()
        .any(|item| matches!(item, Value::Link(rid) if index.contains_key(rid)));

    let mut out = Vec::with_capacity(items.len());
    for item in items.drain(..) {
        match item {
            Value::Link(rid) => match index.get(&rid) {
                Some(target) => out.push(Value::Record(target.clone())),
                None if any_resolved => {}
                None => out.push(Value::Link(rid)),
            },
            mut other => {
                resolve_value(&mut other, index);
                out.push(other);
            }
        }
    }
    *items = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(rid: RecordId) -> Document {
        let mut doc = Document::new();
        doc.set_rid(rid);
        doc
    }

    #[test]
    fn test_link_replaced_by_companion() {
        let mut primary = record(RecordId::new(1, 0));
        primary.insert("friend", Value::Link(RecordId::new(2, 0)));
        let companion = record(RecordId::new(2, 0)).with_field("name", "Ann");

        let resolved = resolve(primary, vec![companion]);
        let doc = resolved.read();
        let friend = doc.get("friend").and_then(Value::as_record).unwrap();
        assert_eq!(
            friend.read().get("name"),
            Some(&Value::String("Ann".to_string()))
        );
    }

    #[test]
    fn test_unresolved_link_left_alone() {
        let mut primary = record(RecordId::new(1, 0));
        primary.insert("friend", Value::Link(RecordId::new(9, 9)));

        let resolved = resolve(primary, vec![]);
        assert_eq!(
            resolved.read().get("friend"),
            Some(&Value::Link(RecordId::new(9, 9)))
        );
    }

    #[test]
    fn test_companion_cross_references_share_instance() {
        let x_rid = RecordId::new(3, 1);
        let mut primary = record(RecordId::new(1, 0));
        primary.insert("x", Value::Link(x_rid));

        let mut y = record(RecordId::new(2, 0));
        y.insert("x", Value::Link(x_rid));
        let x = record(x_rid).with_field("name", "X");

        // Keep a handle on y by linking it from the primary too.
        primary.insert("y", Value::Link(RecordId::new(2, 0)));

        let resolved = resolve(primary, vec![y, x]);
        let doc = resolved.read();
        let x_from_primary = doc.get("x").and_then(Value::as_record).unwrap().clone();
        let y_shared = doc.get("y").and_then(Value::as_record).unwrap().clone();
        drop(doc);

        let x_from_y = y_shared
            .read()
            .get("x")
            .and_then(Value::as_record)
            .unwrap()
            .clone();
        assert!(Arc::ptr_eq(&x_from_primary, &x_from_y));
    }

    #[test]
    fn test_self_link_resolves_to_itself() {
        let rid = RecordId::new(1, 1);
        let mut primary = record(rid);
        primary.insert("me", Value::Link(rid));

        let resolved = resolve(primary, vec![]);
        let me = resolved
            .read()
            .get("me")
            .and_then(Value::as_record)
            .unwrap()
            .clone();
        assert!(Arc::ptr_eq(&me, &resolved));
    }

    #[test]
    fn test_mutual_cycle_terminates() {
        let a_rid = RecordId::new(1, 0);
        let b_rid = RecordId::new(2, 0);

        let mut a = record(a_rid);
        a.insert("other", Value::Link(b_rid));
        let mut b = record(b_rid);
        b.insert("other", Value::Link(a_rid));

        let resolved = resolve(a, vec![b]);
        let b_shared = resolved
            .read()
            .get("other")
            .and_then(Value::as_record)
            .unwrap()
            .clone();
        let back = b_shared
            .read()
            .get("other")
            .and_then(Value::as_record)
            .unwrap()
            .clone();
        assert!(Arc::ptr_eq(&back, &resolved));
    }

    #[test]
    fn test_link_list_drops_unresolved_once_any_resolves() {
        let mut primary = record(RecordId::new(1, 0));
        primary.insert(
            "links",
            Value::List(vec![
                Value::Link(RecordId::new(2, 0)),
                Value::Link(RecordId::new(9, 9)),
            ]),
        );
        let companion = record(RecordId::new(2, 0));

        let resolved = resolve(primary, vec![companion]);
        let doc = resolved.read();
        let links = doc.get("links").and_then(Value::as_list).unwrap();
        assert_eq!(links.len(), 1);
        assert!(matches!(links[0], Value::Record(_)));
    }

    #[test]
    fn test_link_list_untouched_when_nothing_resolves() {
        let mut primary = record(RecordId::new(1, 0));
        let links = Value::List(vec![
            Value::Link(RecordId::new(8, 8)),
            Value::Link(RecordId::new(9, 9)),
        ]);
        primary.insert("links", links.clone());

        let resolved = resolve(primary, vec![]);
        assert_eq!(resolved.read().get("links"), Some(&links));
    }

    #[test]
    fn test_links_inside_nested_values_resolve() {
        let target_rid = RecordId::new(4, 2);
        let mut primary = record(RecordId::new(1, 0));
        primary.insert(
            "nested",
            Value::Embedded(Document::new().with_field("deep", target_rid)),
        );
        primary.insert(
            "mapped",
            Value::Map(vec![("deep".to_string(), Value::Link(target_rid))]),
        );
        let companion = record(target_rid);

        let resolved = resolve(primary, vec![companion]);
        let doc = resolved.read();
        let nested = doc.get("nested").and_then(Value::as_embedded).unwrap();
        assert!(matches!(nested.get("deep"), Some(Value::Record(_))));
        match doc.get("mapped") {
            Some(Value::Map(entries)) => assert!(matches!(entries[0].1, Value::Record(_))),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_resolve_all_shares_companions_across_primaries() {
        let target_rid = RecordId::new(5, 0);
        let mut p1 = record(RecordId::new(1, 0));
        p1.insert("t", Value::Link(target_rid));
        let mut p2 = record(RecordId::new(2, 0));
        p2.insert("t", Value::Link(target_rid));

        let resolved = resolve_all(vec![p1, p2], vec![record(target_rid)]);
        let t1 = resolved[0]
            .read()
            .get("t")
            .and_then(Value::as_record)
            .unwrap()
            .clone();
        let t2 = resolved[1]
            .read()
            .get("t")
            .and_then(Value::as_record)
            .unwrap()
            .clone();
        assert!(Arc::ptr_eq(&t1, &t2));
    }

    #[test]
    fn test_metadata_is_not_traversed() {
        // Structural: metadata lives outside the field list, so a
        // record id never resolves "into" a field by accident.
        let mut primary = record(RecordId::new(1, 0));
        primary.insert("n", Value::Int(1));
        let resolved = resolve(primary, vec![record(RecordId::new(1, 0))]);
        assert_eq!(resolved.read().get("n"), Some(&Value::Int(1)));
    }
}
