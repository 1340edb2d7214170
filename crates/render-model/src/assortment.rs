//! Finite sets of legal configs with a designated default.
//!
//! Assortments are combined with `*` (product), `+` (union) and `-`
//! (difference). Every construction asserts that the default is still a
//! member; a violation means a format definition is wrong.

use std::collections::HashSet;
use std::ops::{Add, Mul, Sub};

use crate::config::Config;
use crate::property::{AnyProperty, Property, PropertyValue, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assortment {
    configs: Vec<Config>,
    default: Config,
}

impl Assortment {
    /// Build from configs in order; duplicates are dropped.
    ///
    /// # Panics
    /// If `default` is not among `configs`.
    pub fn new(configs: impl IntoIterator<Item = Config>, default: Config) -> Self {
        let mut seen = HashSet::new();
        let configs: Vec<Config> = configs
            .into_iter()
            .filter(|c| seen.insert(c.clone()))
            .collect();
        assert!(
            seen.contains(&default),
            "assortment default {default} is not one of its configs"
        );
        Self { configs, default }
    }

    /// Exactly one config holding `value`.
    pub fn fixed<T: PropertyValue>(property: &Property<T>, value: T) -> Self {
        let config = Config::new().with(property, value);
        Self::new([config.clone()], config)
    }

    /// One config per option. The default is the property's standard default
    /// when it is offered, otherwise the first option.
    pub fn choice<T: PropertyValue>(property: &Property<T>, options: &[T]) -> Self {
        let default = if options.contains(&property.standard_default()) {
            property.standard_default()
        } else {
            *options
                .first()
                .unwrap_or_else(|| panic!("choice of '{property}' needs at least one option"))
        };
        Self::choice_with_default(property, options, default)
    }

    pub fn choice_with_default<T: PropertyValue>(
        property: &Property<T>,
        options: &[T],
        default: T,
    ) -> Self {
        Self::new(
            options.iter().map(|v| Config::new().with(property, *v)),
            Config::new().with(property, default),
        )
    }

    /// One config per standard option of `property`.
    pub fn choice_all<T: PropertyValue>(property: &Property<T>) -> Self {
        Self::choice(property, property.standard_options())
    }

    pub fn configs(&self) -> &[Config] {
        &self.configs
    }

    pub fn default_config(&self) -> &Config {
        &self.default
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    pub fn contains(&self, config: &Config) -> bool {
        self.configs.contains(config)
    }

    /// Values `property` may take while every property outside
    /// `discard ∪ {property}` keeps the value it has in `base`.
    ///
    /// Ordered by the property's standard options, deduplicated.
    pub fn options<T: PropertyValue>(
        &self,
        property: &Property<T>,
        base: &Config,
        discard: &[&dyn AnyProperty],
    ) -> Vec<T> {
        let mut allowed: Vec<&str> = discard.iter().map(|p| p.name()).collect();
        allowed.push(property.name());

        let mut values: Vec<T> = self
            .configs
            .iter()
            .filter(|c| c.differs_only_in(base, &allowed))
            .filter_map(|c| c.get(property))
            .collect();
        values.sort_by_key(|v| (property.rank(*v), *v));
        values.dedup();

        debug_assert!(
            !values.is_empty() || !self.contains(base),
            "no options for '{property}' around legal config {base}"
        );
        values
    }

    /// Type-erased [`Assortment::options`].
    pub fn options_any(
        &self,
        property: &dyn AnyProperty,
        base: &Config,
        discard: &[&dyn AnyProperty],
    ) -> Vec<Value> {
        let mut allowed: Vec<&str> = discard.iter().map(|p| p.name()).collect();
        allowed.push(property.name());

        let mut values: Vec<Value> = self
            .configs
            .iter()
            .filter(|c| c.differs_only_in(base, &allowed))
            .filter_map(|c| c.value_of(property))
            .collect();
        values.sort_by_key(|v| (property.rank_value(*v), *v));
        values.dedup();
        values
    }

    /// Whether any config constrains `property`.
    pub fn mentions(&self, property: &dyn AnyProperty) -> bool {
        self.configs.iter().any(|c| c.contains(property))
    }

    /// The default config's value, falling back to the property's standard default.
    pub fn default_value<T: PropertyValue>(&self, property: &Property<T>) -> T {
        self.default.get_or_default(property)
    }
}

impl Mul for Assortment {
    type Output = Assortment;

    fn mul(self, rhs: Assortment) -> Assortment {
        debug_assert!(
            !self.default.shares_keys_with(&rhs.default),
            "product operands should constrain disjoint properties"
        );
        let configs: Vec<Config> = self
            .configs
            .iter()
            .flat_map(|l| rhs.configs.iter().map(move |r| l.merged(r)))
            .collect();
        Assortment::new(configs, self.default.merged(&rhs.default))
    }
}

impl Add for Assortment {
    type Output = Assortment;

    fn add(self, rhs: Assortment) -> Assortment {
        Assortment::new(self.configs.into_iter().chain(rhs.configs), self.default)
    }
}

impl Sub for Assortment {
    type Output = Assortment;

    fn sub(self, rhs: Assortment) -> Assortment {
        let configs = self
            .configs
            .into_iter()
            .filter(|c| !rhs.configs.iter().any(|r| c.is_superset_of(r)));
        Assortment::new(configs, self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::Scan;
    use crate::property::{Channels, ProResProfile, CHANNELS, DEPTH, PRORES_PROFILE, SCAN};
    use proptest::prelude::*;

    fn depth_channels() -> Assortment {
        Assortment::choice(&DEPTH, &[8, 16])
            * Assortment::choice(&CHANNELS, &[Channels::Color, Channels::Alpha])
    }

    #[test]
    fn test_product_covers_cross_product() {
        let a = depth_channels();
        assert_eq!(a.len(), 4);
        assert_eq!(a.default_config().get(&DEPTH), Some(8));
        assert_eq!(a.default_config().get(&CHANNELS), Some(Channels::Color));
    }

    #[test]
    fn test_union_keeps_left_default_and_dedups() {
        let a = Assortment::choice(&DEPTH, &[8, 10]) + Assortment::choice(&DEPTH, &[10, 16]);
        assert_eq!(a.len(), 3);
        assert_eq!(a.default_config().get(&DEPTH), Some(8));
    }

    #[test]
    fn test_difference_removes_supersets() {
        let a = depth_channels() - Assortment::fixed(&CHANNELS, Channels::Alpha);
        assert_eq!(a.len(), 2);
        assert!(a
            .configs()
            .iter()
            .all(|c| c.get(&CHANNELS) == Some(Channels::Color)));
    }

    #[test]
    #[should_panic(expected = "not one of its configs")]
    fn test_difference_removing_default_panics() {
        let _ = depth_channels() - Assortment::fixed(&DEPTH, 8);
    }

    #[test]
    fn test_choice_default_falls_back_to_first_option() {
        let a = Assortment::choice(&DEPTH, &[10, 12]);
        assert_eq!(a.default_value(&DEPTH), 10);
        assert_eq!(a.default_value(&SCAN), Scan::Progressive);
    }

    #[test]
    fn test_options_follow_dependencies() {
        let a = (Assortment::choice(&CHANNELS, &[Channels::Color, Channels::ColorAndAlpha])
            * Assortment::choice_all(&PRORES_PROFILE))
            - (Assortment::fixed(&CHANNELS, Channels::ColorAndAlpha)
                * Assortment::choice(&PRORES_PROFILE, &ProResProfile::ALL_422));

        let base = a.default_config().clone();
        let profiles = a.options(&PRORES_PROFILE, &base, &[]);
        assert_eq!(profiles.len(), 6);

        let alpha = base.with(&CHANNELS, Channels::ColorAndAlpha).with(&PRORES_PROFILE, ProResProfile::P4444);
        let profiles = a.options(&PRORES_PROFILE, &alpha, &[]);
        assert_eq!(profiles, vec![ProResProfile::P4444, ProResProfile::P4444Xq]);

        // With the profile discarded, alpha is offered regardless of the current profile.
        let hq = a.default_config().clone();
        assert_eq!(a.options(&CHANNELS, &hq, &[]), vec![Channels::Color]);
        assert_eq!(
            a.options(&CHANNELS, &hq, &[&PRORES_PROFILE]),
            vec![Channels::Color, Channels::ColorAndAlpha]
        );
    }

    fn arb_assortment() -> impl Strategy<Value = Assortment> {
        let depth = prop::sample::subsequence(vec![8, 10, 12, 16, 32], 1..=5)
            .prop_map(|opts| Assortment::choice(&DEPTH, &opts));
        let channels = prop::sample::subsequence(
            vec![Channels::Color, Channels::ColorAndAlpha, Channels::Alpha],
            1..=3,
        )
        .prop_map(|opts| Assortment::choice(&CHANNELS, &opts));
        let scan = prop::sample::subsequence(
            vec![
                Scan::Progressive,
                Scan::InterlacedTopFieldFirst,
                Scan::InterlacedBottomFieldFirst,
            ],
            1..=3,
        )
        .prop_map(|opts| Assortment::choice(&SCAN, &opts));

        (depth, channels, scan, any::<bool>(), prop::sample::select(vec![8, 10, 12, 16, 32]))
            .prop_map(|(depth, channels, scan, union_extra, removed_depth)| {
                let mut a = depth * channels;
                if union_extra {
                    a = a + Assortment::fixed(&DEPTH, 12) * Assortment::fixed(&CHANNELS, Channels::Alpha);
                }
                let a = a * scan;
                if a.default_value(&DEPTH) != removed_depth {
                    a - Assortment::fixed(&DEPTH, removed_depth)
                } else {
                    a
                }
            })
    }

    proptest! {
        #[test]
        fn prop_default_is_member(a in arb_assortment()) {
            prop_assert!(a.contains(a.default_config()));
        }

        #[test]
        fn prop_options_contain_base_value(a in arb_assortment(), pick in any::<prop::sample::Index>()) {
            let base = pick.get(a.configs()).clone();
            if let Some(depth) = base.get(&DEPTH) {
                prop_assert!(a.options(&DEPTH, &base, &[]).contains(&depth));
            }
            if let Some(channels) = base.get(&CHANNELS) {
                prop_assert!(a.options(&CHANNELS, &base, &[&DEPTH]).contains(&channels));
            }
        }
    }
}
