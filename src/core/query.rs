// Join-mode key-set resolution and predicate evaluation over loaded fields.
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use serde::de::DeserializeOwned;

use crate::core::error::{Error, ErrorKind};
use crate::core::field::Field;
use crate::core::store::FieldStore;
use crate::field_names::check_store_name;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum JoinMode {
    /// Keys present in every queried field.
    #[default]
    Inner,
    /// Keys present in any queried field.
    Outer,
}

impl JoinMode {
    pub fn as_str(self) -> &'static str {
        match self {
            JoinMode::Inner => "inner",
            JoinMode::Outer => "outer",
        }
    }
}

impl fmt::Display for JoinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JoinMode {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "inner" | "inner_join" => Ok(JoinMode::Inner),
            "outer" | "outer_join" => Ok(JoinMode::Outer),
            _ => Err(Error::new(ErrorKind::Usage)
                .with_message(format!("unknown join mode `{raw}`"))
                .with_hint("Use `inner` (keys in all fields) or `outer` (keys in any field).")),
        }
    }
}

/// Matched groups: grouping-field value (`None` when a key has no value
/// there) to the member keys of that group.
pub type Groups<K, V> = HashMap<Option<V>, Vec<K>>;

/// Stateless query front-end over a [`FieldStore`].
///
/// Every call loads the named fields in full; nothing is cached between
/// calls and no snapshot is taken across fields.
#[derive(Clone, Copy, Debug)]
pub struct QueryEngine<'a> {
    store: &'a FieldStore,
}

impl<'a> QueryEngine<'a> {
    pub fn new(store: &'a FieldStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &'a FieldStore {
        self.store
    }

    /// Keys whose per-field values satisfy `predicate`.
    ///
    /// The predicate receives one slot per name in `field_names`, in that
    /// order, holding `None` where the key has no value in that field.
    pub fn find_keys<K, V, N, P>(
        &self,
        field_names: &[N],
        mode: JoinMode,
        mut predicate: P,
    ) -> Result<HashSet<K>, Error>
    where
        K: Eq + Hash + Clone + DeserializeOwned,
        V: DeserializeOwned,
        N: AsRef<str>,
        P: FnMut(&[Option<&V>]) -> bool,
    {
        self.try_find_keys(field_names, mode, |values| Ok(predicate(values)))
    }

    /// [`QueryEngine::find_keys`] with a fallible predicate. The first
    /// predicate error aborts the query and is returned as-is.
    pub fn try_find_keys<K, V, N, P>(
        &self,
        field_names: &[N],
        mode: JoinMode,
        mut predicate: P,
    ) -> Result<HashSet<K>, Error>
    where
        K: Eq + Hash + Clone + DeserializeOwned,
        V: DeserializeOwned,
        N: AsRef<str>,
        P: FnMut(&[Option<&V>]) -> Result<bool, Error>,
    {
        let names = check_field_names(field_names)?;
        let fields = self.load_fields::<K, V>(&names)?;
        let keys = resolve_key_set(&fields, mode);
        tracing::debug!(fields = ?names, %mode, keys = keys.len(), "resolved key set");

        let mut matched = HashSet::new();
        let mut values = Vec::with_capacity(fields.len());
        for key in keys {
            values.clear();
            values.extend(fields.iter().map(|field| field.get(key)));
            if predicate(&values)? {
                matched.insert(key.clone());
            }
        }
        Ok(matched)
    }

    /// Groups of keys, bucketed by their value in `group_by_field`, whose
    /// per-field value lists satisfy `predicate`.
    ///
    /// The key set is computed over `field_names` only. The predicate gets
    /// one list per queried field, each aligned with the group's member keys
    /// as they appear in the result.
    pub fn find_keys_group_by<K, V, N, P>(
        &self,
        field_names: &[N],
        group_by_field: &str,
        mode: JoinMode,
        mut predicate: P,
    ) -> Result<Groups<K, V>, Error>
    where
        K: Eq + Hash + Clone + DeserializeOwned,
        V: Eq + Hash + Clone + DeserializeOwned,
        N: AsRef<str>,
        P: FnMut(&[Vec<Option<&V>>]) -> bool,
    {
        self.try_find_keys_group_by(field_names, group_by_field, mode, |lists| {
            Ok(predicate(lists))
        })
    }

    pub fn try_find_keys_group_by<K, V, N, P>(
        &self,
        field_names: &[N],
        group_by_field: &str,
        mode: JoinMode,
        mut predicate: P,
    ) -> Result<Groups<K, V>, Error>
    where
        K: Eq + Hash + Clone + DeserializeOwned,
        V: Eq + Hash + Clone + DeserializeOwned,
        N: AsRef<str>,
        P: FnMut(&[Vec<Option<&V>>]) -> Result<bool, Error>,
    {
        let names = check_field_names(field_names)?;
        check_store_name(group_by_field).map_err(|err| {
            Error::from(err)
                .with_message("invalid group-by field name")
                .with_field(group_by_field)
        })?;
        let fields = self.load_fields::<K, V>(&names)?;

        let loaded_group;
        let group_field = match names.iter().position(|name| *name == group_by_field) {
            Some(idx) => &fields[idx],
            None => {
                loaded_group = self.store.load_field::<K, V>(group_by_field)?;
                &loaded_group
            }
        };

        let keys = resolve_key_set(&fields, mode);
        let mut grouped: HashMap<Option<&V>, Vec<&K>> = HashMap::new();
        for key in keys {
            grouped.entry(group_field.get(key)).or_default().push(key);
        }
        tracing::debug!(
            fields = ?names,
            group_by = group_by_field,
            %mode,
            groups = grouped.len(),
            "partitioned key set"
        );

        let mut matched = HashMap::new();
        for (group_key, members) in grouped {
            let lists: Vec<Vec<Option<&V>>> = fields
                .iter()
                .map(|field| members.iter().map(|key| field.get(*key)).collect())
                .collect();
            if predicate(&lists)? {
                matched.insert(
                    group_key.cloned(),
                    members.into_iter().cloned().collect(),
                );
            }
        }
        Ok(matched)
    }

    fn load_fields<K, V>(&self, names: &[&str]) -> Result<Vec<Field<K, V>>, Error>
    where
        K: Eq + Hash + DeserializeOwned,
        V: DeserializeOwned,
    {
        names
            .iter()
            .map(|name| self.store.load_field(name))
            .collect()
    }
}

/// At least one name, each valid, none repeated.
fn check_field_names<N: AsRef<str>>(field_names: &[N]) -> Result<Vec<&str>, Error> {
    if field_names.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("a query needs at least one field name"));
    }
    let mut seen = HashSet::with_capacity(field_names.len());
    let mut names = Vec::with_capacity(field_names.len());
    for name in field_names {
        let name = name.as_ref();
        check_store_name(name).map_err(|err| Error::from(err).with_field(name))?;
        if !seen.insert(name) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("field `{name}` is listed more than once"))
                .with_field(name));
        }
        names.push(name);
    }
    Ok(names)
}

fn resolve_key_set<K, V>(fields: &[Field<K, V>], mode: JoinMode) -> HashSet<&K>
where
    K: Eq + Hash,
{
    match mode {
        JoinMode::Inner => {
            let Some((first, rest)) = fields.split_first() else {
                return HashSet::new();
            };
            first
                .keys()
                .filter(|key| rest.iter().all(|field| field.contains_key(*key)))
                .collect()
        }
        JoinMode::Outer => fields.iter().flat_map(|field| field.keys()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::{JoinMode, QueryEngine, check_field_names, resolve_key_set};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::field::Field;
    use crate::core::store::FieldStore;
    use crate::core::value::Value;
    use std::collections::HashSet;

    fn field(entries: &[(&str, i64)]) -> Field<String, Value> {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), Value::Int(*value)))
            .collect()
    }

    fn keys(set: HashSet<&String>) -> Vec<String> {
        let mut out: Vec<String> = set.into_iter().cloned().collect();
        out.sort();
        out
    }

    #[test]
    fn inner_is_intersection_and_outer_is_union() {
        let fields = vec![
            field(&[("a", 1), ("b", 2), ("c", 3)]),
            field(&[("b", 1), ("c", 1), ("d", 1)]),
        ];
        assert_eq!(keys(resolve_key_set(&fields, JoinMode::Inner)), vec!["b", "c"]);
        assert_eq!(
            keys(resolve_key_set(&fields, JoinMode::Outer)),
            vec!["a", "b", "c", "d"]
        );
    }

    #[test]
    fn empty_field_empties_inner_join() {
        let fields = vec![field(&[("a", 1)]), Field::new()];
        assert!(resolve_key_set(&fields, JoinMode::Inner).is_empty());
        assert_eq!(keys(resolve_key_set(&fields, JoinMode::Outer)), vec!["a"]);
    }

    #[test]
    fn join_mode_parses_both_spellings() {
        assert_eq!("inner".parse::<JoinMode>().unwrap(), JoinMode::Inner);
        assert_eq!("OUTER_JOIN".parse::<JoinMode>().unwrap(), JoinMode::Outer);
        assert_eq!(JoinMode::default(), JoinMode::Inner);
        let err = "sideways".parse::<JoinMode>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn field_names_must_be_present_and_distinct() {
        let none: [&str; 0] = [];
        assert_eq!(check_field_names(&none).unwrap_err().kind(), ErrorKind::Usage);
        let err = check_field_names(&["a", "b", "a"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(err.field(), Some("a"));
        assert_eq!(check_field_names(&["b", "a"]).unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn precondition_failure_happens_before_predicate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FieldStore::open(dir.path()).expect("open");
        let engine = QueryEngine::new(&store);
        let none: [&str; 0] = [];
        let err = engine
            .find_keys::<String, Value, _, _>(&none, JoinMode::Outer, |_| {
                panic!("predicate must not run")
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn predicate_error_aborts_query() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FieldStore::open(dir.path()).expect("open");
        store
            .dump_field("v", &field(&[("a", 1), ("b", 2), ("c", 3)]))
            .expect("dump");
        let engine = QueryEngine::new(&store);
        let mut calls = 0;
        let result = engine.try_find_keys::<String, Value, _, _>(&["v"], JoinMode::Inner, |_| {
            calls += 1;
            Err(Error::new(ErrorKind::Predicate).with_message("boom"))
        });
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Predicate);
        assert_eq!(err.message(), Some("boom"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn group_by_field_may_be_queried_too() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FieldStore::open(dir.path()).expect("open");
        store
            .dump_field("bucket", &field(&[("a", 1), ("b", 1), ("c", 2)]))
            .expect("dump");
        let engine = QueryEngine::new(&store);
        let groups = engine
            .find_keys_group_by::<String, Value, _, _>(
                &["bucket"],
                "bucket",
                JoinMode::Inner,
                |lists| lists[0].iter().all(|value| value.is_some()),
            )
            .expect("query");
        assert_eq!(groups.len(), 2);
        let mut ones = groups[&Some(Value::Int(1))].clone();
        ones.sort();
        assert_eq!(ones, vec!["a", "b"]);
        assert_eq!(groups[&Some(Value::Int(2))], vec!["c"]);
    }

    #[test]
    fn group_by_rejects_invalid_group_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FieldStore::open(dir.path()).expect("open");
        let engine = QueryEngine::new(&store);
        let err = engine
            .find_keys_group_by::<String, Value, _, _>(&["v"], "", JoinMode::Inner, |_| true)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
