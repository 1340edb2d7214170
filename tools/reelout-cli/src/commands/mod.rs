pub mod check;
pub mod formats;
pub mod options;

use anyhow::Context;
use reelout_render_engine::{render_format_by_label, RenderFormat};
use reelout_render_model::{property_by_name, Config};

pub(crate) fn find_format(label: &str) -> anyhow::Result<&'static RenderFormat> {
    render_format_by_label(label)
        .with_context(|| format!("Unknown format '{label}'. Run `reelout formats` for the list."))
}

/// Apply `name=value` overrides on top of `base`.
pub(crate) fn apply_overrides(base: &Config, overrides: &[String]) -> anyhow::Result<Config> {
    let mut config = base.clone();
    for entry in overrides {
        let (name, value) = entry
            .split_once('=')
            .with_context(|| format!("Override '{entry}' is not of the form PROPERTY=VALUE"))?;
        let property = property_by_name(name.trim())
            .with_context(|| format!("Unknown property '{}'", name.trim()))?;
        let parsed = property.parse_value(value).with_context(|| {
            let choices: Vec<String> = property
                .standard_values()
                .iter()
                .map(ToString::to_string)
                .collect();
            format!(
                "'{}' is not a value of {}; expected one of: {}",
                value.trim(),
                property.name(),
                choices.join(", ")
            )
        })?;
        config = config.with_value(property, parsed);
    }
    Ok(config)
}
