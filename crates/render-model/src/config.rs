//! Immutable property-to-value mappings.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use reelout_common::{DeliveryError, DeliveryResult};

use crate::property::{property_by_name, AnyProperty, Property, PropertyValue, Value};

/// Assignment of values to properties. A missing property is unconstrained.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Config {
    values: BTreeMap<&'static str, Value>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: PropertyValue>(&self, property: &Property<T>) -> Option<T> {
        self.values
            .get(property.name())
            .and_then(|v| T::from_value(*v))
    }

    /// Value of `property`, or its standard default when unconstrained.
    pub fn get_or_default<T: PropertyValue>(&self, property: &Property<T>) -> T {
        self.get(property)
            .unwrap_or_else(|| property.standard_default())
    }

    /// Value of `property`, which must be present.
    pub fn require<T: PropertyValue>(&self, property: &Property<T>) -> DeliveryResult<T> {
        self.get(property).ok_or_else(|| {
            DeliveryError::configuration(format!("config {self} does not set '{property}'"))
        })
    }

    pub fn with<T: PropertyValue>(mut self, property: &Property<T>, value: T) -> Self {
        self.values.insert(property.name(), value.into_value());
        self
    }

    /// Functional update with a type-erased value.
    pub fn with_value(mut self, property: &dyn AnyProperty, value: Value) -> Self {
        self.values.insert(property.name(), value);
        self
    }

    pub fn value_of(&self, property: &dyn AnyProperty) -> Option<Value> {
        self.values.get(property.name()).copied()
    }

    pub fn contains(&self, property: &dyn AnyProperty) -> bool {
        self.values.contains_key(property.name())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Property names and values in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, Value)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }

    /// Whether every key/value pair of `other` also appears in `self`.
    pub fn is_superset_of(&self, other: &Config) -> bool {
        other
            .values
            .iter()
            .all(|(k, v)| self.values.get(k) == Some(v))
    }

    /// Whether `self` and `other` agree on every property outside `allowed`.
    ///
    /// A property absent from both configs counts as agreement.
    pub fn differs_only_in(&self, other: &Config, allowed: &[&str]) -> bool {
        self.values
            .keys()
            .chain(other.values.keys())
            .filter(|k| !allowed.contains(*k))
            .all(|k| self.values.get(k) == other.values.get(k))
    }

    /// Union of both mappings; `other` wins on shared keys.
    pub fn merged(&self, other: &Config) -> Config {
        let mut values = self.values.clone();
        values.extend(other.values.iter().map(|(k, v)| (*k, *v)));
        Config { values }
    }

    pub(crate) fn shares_keys_with(&self, other: &Config) -> bool {
        self.values.keys().any(|k| other.values.contains_key(k))
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.values.iter()).finish()
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        f.write_str("}")
    }
}

impl Serialize for Config {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Config {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
        let mut values = BTreeMap::new();
        for (name, value) in raw {
            let property = property_by_name(&name)
                .ok_or_else(|| D::Error::custom(format!("unknown property '{name}'")))?;
            let expected = property.standard_default_value();
            if std::mem::discriminant(&value) != std::mem::discriminant(&expected) {
                return Err(D::Error::custom(format!(
                    "property '{name}' cannot hold {value:?}"
                )));
            }
            values.insert(property.name(), value);
        }
        Ok(Config { values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{Channels, CHANNELS, DEPTH, SCAN};

    #[test]
    fn test_get_and_defaults() {
        let config = Config::new().with(&DEPTH, 16);
        assert_eq!(config.get(&DEPTH), Some(16));
        assert_eq!(config.get(&CHANNELS), None);
        assert_eq!(config.get_or_default(&CHANNELS), Channels::Color);
        assert!(config.require(&CHANNELS).is_err());
    }

    #[test]
    fn test_superset_and_differs_only_in() {
        let a = Config::new().with(&DEPTH, 8).with(&CHANNELS, Channels::Color);
        let b = Config::new().with(&DEPTH, 16).with(&CHANNELS, Channels::Color);
        let partial = Config::new().with(&CHANNELS, Channels::Color);

        assert!(a.is_superset_of(&partial));
        assert!(!partial.is_superset_of(&a));
        assert!(a.differs_only_in(&b, &["depth"]));
        assert!(!a.differs_only_in(&b, &["channels"]));
        // A key present on only one side counts as a difference.
        assert!(!a.differs_only_in(&partial, &["channels"]));
        assert!(a.differs_only_in(&partial, &["depth"]));
    }

    #[test]
    fn test_json_roundtrip_and_unknown_keys() {
        let config = Config::new()
            .with(&DEPTH, 10)
            .with(&SCAN, crate::bitmap::Scan::InterlacedTopFieldFirst);
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let err = serde_json::from_str::<Config>(r#"{"bogus": {"int": 1}}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_json_rejects_value_of_wrong_type() {
        let err = serde_json::from_str::<Config>(r#"{"depth": {"bool": true}}"#)
            .expect_err("a bool is not a depth");
        assert!(err.to_string().contains("depth"));
        let ok: Config = serde_json::from_str(r#"{"depth": {"int": 16}}"#).unwrap();
        assert_eq!(ok.get(&DEPTH), Some(16));
    }

    #[test]
    fn test_display_lists_labels() {
        let config = Config::new().with(&DEPTH, 8).with(&CHANNELS, Channels::Alpha);
        assert_eq!(config.to_string(), "{channels=Alpha, depth=8}");
    }
}
