// Dynamic field value with total equality, hashing and ordering.
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Object key tagging a non-finite float, e.g. `{"$float": "-inf"}`.
pub const FLOAT_TAG: &str = "$float";
/// Object key wrapping a map that would otherwise read as a tag.
pub const MAP_TAG: &str = "$map";

/// A JSON-shaped value that can also serve as a group key.
///
/// Integers and floats are distinct kinds: `1` and `1.0` are different
/// values. Floats compare and hash by bit pattern, so `NaN` equals itself
/// and `0.0` differs from `-0.0`.
///
/// JSON has no spelling for `NaN` or the infinities, so they are written as
/// a single-key `{"$float": "nan" | "inf" | "-inf"}` object. A NaN with a
/// non-default payload is written as `"nan:<hex bits>"`. A map whose only key
/// is `$float` or `$map` is wrapped as `{"$map": {...}}` so that every value
/// reads back as itself.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    fn kind_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) => 2,
            Self::Float(_) => 3,
            Self::Str(_) => 4,
            Self::List(_) => 5,
            Self::Map(_) => 6,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view of either number kind.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Integral view used for positions; floats qualify only when whole.
    pub fn as_index(&self) -> Option<isize> {
        match self {
            Self::Int(n) => isize::try_from(*n).ok(),
            Self::Float(n) if n.is_finite() && n.fract() == 0.0 => {
                let cast = *n as isize;
                (cast as f64 == *n).then_some(cast)
            }
            _ => None,
        }
    }

    /// Convert to `serde_json::Value`, using the same tags as the stored form.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(n) => serde_json::Value::from(*n),
            Self::Float(n) => match serde_json::Number::from_f64(*n) {
                Some(num) => serde_json::Value::Number(num),
                None => tagged(FLOAT_TAG, serde_json::Value::String(non_finite_label(*n))),
            },
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Map(map) => {
                let object = serde_json::Value::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), v.to_json()))
                        .collect(),
                );
                if looks_tagged(map) {
                    tagged(MAP_TAG, object)
                } else {
                    object
                }
            }
        }
    }

    fn from_object(mut map: serde_json::Map<String, serde_json::Value>) -> Self {
        if map.len() == 1 {
            if let Some(n) = map
                .get(FLOAT_TAG)
                .and_then(serde_json::Value::as_str)
                .and_then(parse_non_finite)
            {
                return Self::Float(n);
            }
            match map.remove(MAP_TAG) {
                Some(serde_json::Value::Object(inner)) => return Self::Map(plain_map(inner)),
                Some(other) => {
                    map.insert(MAP_TAG.to_string(), other);
                }
                None => {}
            }
        }
        Self::Map(plain_map(map))
    }
}

fn plain_map(map: serde_json::Map<String, serde_json::Value>) -> BTreeMap<String, Value> {
    map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()
}

fn looks_tagged(map: &BTreeMap<String, Value>) -> bool {
    map.len() == 1 && map.keys().all(|key| key == FLOAT_TAG || key == MAP_TAG)
}

fn tagged(tag: &str, inner: serde_json::Value) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    object.insert(tag.to_string(), inner);
    serde_json::Value::Object(object)
}

fn non_finite_label(n: f64) -> String {
    if n == f64::INFINITY {
        "inf".to_string()
    } else if n == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if n.to_bits() == f64::NAN.to_bits() {
        "nan".to_string()
    } else {
        format!("nan:{:016x}", n.to_bits())
    }
}

fn parse_non_finite(label: &str) -> Option<f64> {
    match label {
        "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        "nan" => Some(f64::NAN),
        _ => {
            let bits = u64::from_str_radix(label.strip_prefix("nan:")?, 16).ok()?;
            let n = f64::from_bits(bits);
            n.is_nan().then_some(n)
        }
    }
}

struct PlainMap<'a>(&'a BTreeMap<String, Value>);

impl Serialize for PlainMap<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map_or(Self::Null, Self::Float),
            },
            serde_json::Value::String(s) => Self::Str(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => Self::from_object(map),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Self::List(value.into_iter().map(Into::into).collect())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind_rank().hash(state);
        match self {
            Self::Null => {}
            Self::Bool(b) => b.hash(state),
            Self::Int(n) => n.hash(state),
            Self::Float(n) => n.to_bits().hash(state),
            Self::Str(s) => s.hash(state),
            Self::List(items) => items.hash(state),
            Self::Map(map) => map.hash(state),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let ka = self.kind_rank();
        let kb = other.kind_rank();
        if ka != kb {
            return ka.cmp(&kb);
        }
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::List(a), Self::List(b)) => a.cmp(b),
            (Self::Map(a), Self::Map(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.to_json()) {
            Ok(encoded) => write!(f, "{encoded}"),
            Err(_) => write!(f, "<unencodable value>"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(n) => serializer.serialize_i64(*n),
            Self::Float(n) if n.is_finite() => serializer.serialize_f64(*n),
            Self::Float(n) => {
                let mut tag = serializer.serialize_map(Some(1))?;
                tag.serialize_entry(FLOAT_TAG, &non_finite_label(*n))?;
                tag.end()
            }
            Self::Str(s) => serializer.serialize_str(s),
            Self::List(items) => serializer.collect_seq(items),
            Self::Map(map) if looks_tagged(map) => {
                let mut tag = serializer.serialize_map(Some(1))?;
                tag.serialize_entry(MAP_TAG, &PlainMap(map))?;
                tag.end()
            }
            Self::Map(map) => serializer.collect_map(map),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::from)
    }
}

#[cfg(test)]
mod tests {
    use super::Value;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn json_conversion_keeps_number_kinds() {
        let value = Value::from(json!({"a": 1, "b": 1.5, "c": [null, true, "x"]}));
        let Value::Map(map) = &value else {
            panic!("expected map");
        };
        assert_eq!(map["a"], Value::Int(1));
        assert_eq!(map["b"], Value::Float(1.5));
        assert_eq!(
            map["c"],
            Value::List(vec![Value::Null, Value::Bool(true), Value::from("x")])
        );
        assert_eq!(value.to_json(), json!({"a": 1, "b": 1.5, "c": [null, true, "x"]}));
    }

    #[test]
    fn serde_round_trip_through_json_text() {
        let value = Value::from(json!([1, -2.25, {"k": "v"}, []]));
        let text = serde_json::to_string(&value).expect("encode");
        let decoded: Value = serde_json::from_str(&text).expect("decode");
        assert_eq!(decoded, value);
    }

    #[test]
    fn int_and_float_are_distinct_keys() {
        let mut set = HashSet::new();
        set.insert(Value::Int(1));
        set.insert(Value::Float(1.0));
        set.insert(Value::Int(1));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn nan_is_a_usable_key() {
        let mut set = HashSet::new();
        set.insert(Value::Float(f64::NAN));
        assert!(set.contains(&Value::Float(f64::NAN)));
        assert_eq!(Value::Float(f64::NAN).to_json(), json!({"$float": "nan"}));
    }

    #[test]
    fn non_finite_floats_survive_json_text() {
        let odd_nan = f64::from_bits(0x7ff8_0000_0000_0001);
        for n in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, odd_nan] {
            let value = Value::List(vec![Value::Float(n)]);
            let text = serde_json::to_string(&value).expect("encode");
            let decoded: Value = serde_json::from_str(&text).expect("decode");
            assert_eq!(decoded, value, "{text}");
            assert_eq!(Value::from(value.to_json()), value);
        }
        assert_eq!(
            serde_json::to_string(&Value::Float(f64::NEG_INFINITY)).expect("encode"),
            r#"{"$float":"-inf"}"#
        );
    }

    #[test]
    fn maps_shaped_like_tags_are_escaped() {
        for raw in [json!({"$float": "nan"}), json!({"$map": {"a": 1}}), json!({"$float": 3})] {
            let Value::Map(map) = Value::from(json!({"$map": raw.clone()})) else {
                panic!("expected map");
            };
            let value = Value::Map(map);
            let text = serde_json::to_string(&value).expect("encode");
            let decoded: Value = serde_json::from_str(&text).expect("decode");
            assert_eq!(decoded, value, "{text}");
            assert_eq!(decoded.to_json(), json!({"$map": raw}));
        }
    }

    #[test]
    fn unknown_float_labels_stay_maps() {
        let value = Value::from(json!({"$float": "huge"}));
        assert!(matches!(value, Value::Map(_)));
    }

    #[test]
    fn whole_floats_index_like_ints() {
        assert_eq!(Value::Int(-2).as_index(), Some(-2));
        assert_eq!(Value::Float(3.0).as_index(), Some(3));
        assert_eq!(Value::Float(3.5).as_index(), None);
        assert_eq!(Value::Float(f64::NAN).as_index(), None);
    }

    #[test]
    fn ordering_ranks_kinds_then_payload() {
        let mut values = vec![
            Value::from("b"),
            Value::Int(3),
            Value::Null,
            Value::from("a"),
            Value::Bool(false),
            Value::Int(-1),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Bool(false),
                Value::Int(-1),
                Value::Int(3),
                Value::from("a"),
                Value::from("b"),
            ]
        );
    }

    #[test]
    fn display_is_compact_json() {
        let value = Value::from(json!({"x": [1, "two"]}));
        assert_eq!(value.to_string(), r#"{"x":[1,"two"]}"#);
    }
}
