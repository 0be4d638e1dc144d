use crate::{ConfigLayer, Error, OptionSet, OptionValue};
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
    SetWindowSize,
    AddList,
    RemoveList,
    SetDict,
    Derive,
    Recompute,
}

impl fmt::Display for OverrideAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SetWindowSize => "window",
            Self::AddList => "+list",
            Self::RemoveList => "-list",
            Self::SetDict => "dict",
            Self::Derive => "derive",
            Self::Recompute => "recompute",
        };
        f.write_str(s)
    }
}

/// One entry of the override log: which layer did what to which flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Override {
    pub layer: String,
    pub action: OverrideAction,
    pub flag: String,
    pub value: Option<OptionValue>,
}

/// `round(ratio * window_size)`, ties to even.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn scale_window(ratio: f64, window_size: u32) -> i64 {
    (ratio * f64::from(window_size)).round_ties_even() as i64
}

/// Mutable state threaded through the layers of one chain.
#[derive(Debug, Default)]
pub(crate) struct ChainState {
    pub(crate) options: OptionSet,
    window_size: Option<u32>,
    derived: IndexMap<String, f64>,
    log: Vec<Override>,
}

impl ChainState {
    pub(crate) fn record(
        &mut self,
        layer: &str,
        action: OverrideAction,
        flag: &str,
        value: Option<OptionValue>,
    ) {
        self.log.push(Override {
            layer: layer.to_string(),
            action,
            flag: flag.to_string(),
            value,
        });
    }

    pub(crate) fn set_window_size(&mut self, layer: &str, size: u32) {
        self.window_size = Some(size);
        self.record(
            layer,
            OverrideAction::SetWindowSize,
            "window_size",
            Some(OptionValue::from(size)),
        );
        let derived: Vec<(String, f64)> = self
            .derived
            .iter()
            .map(|(flag, ratio)| (flag.clone(), *ratio))
            .collect();
        for (flag, ratio) in derived {
            let value = OptionValue::Int(scale_window(ratio, size));
            tracing::debug!(layer, flag = %flag, %value, "recomputing window-derived option");
            self.options.set_dict(flag.as_str(), value.clone());
            self.record(layer, OverrideAction::Recompute, &flag, Some(value));
        }
    }

    pub(crate) fn set_literal(&mut self, layer: &str, flag: &str, value: OptionValue) {
        self.derived.shift_remove(flag);
        self.options.set_dict(flag, value.clone());
        self.record(layer, OverrideAction::SetDict, flag, Some(value));
    }

    pub(crate) fn derive(&mut self, layer: &str, flag: &str, ratio: f64) -> Result<(), Error> {
        let window_size = self.window_size.ok_or_else(|| Error::MissingWindowSize {
            variant: layer.to_string(),
            flag: flag.to_string(),
        })?;
        let value = OptionValue::Int(scale_window(ratio, window_size));
        self.derived.insert(flag.to_string(), ratio);
        self.options.set_dict(flag, value.clone());
        self.record(layer, OverrideAction::Derive, flag, Some(value));
        Ok(())
    }
}

/// The resolved root-to-leaf path of one variant.
#[derive(Debug, Clone)]
pub struct ConfigChain<'r> {
    layers: Vec<&'r ConfigLayer>,
}

impl<'r> ConfigChain<'r> {
    /// `layers` must be ordered root first.
    #[must_use]
    pub fn new(layers: Vec<&'r ConfigLayer>) -> Self {
        Self { layers }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.layers.last().map_or("", |layer| layer.name())
    }

    #[must_use]
    pub fn lineage(&self) -> Vec<&str> {
        self.layers.iter().map(|layer| layer.name()).collect()
    }

    pub fn layers(&self) -> impl Iterator<Item = &'r ConfigLayer> + '_ {
        self.layers.iter().copied()
    }

    /// Applies every layer, root first, to a fresh option set.
    pub fn materialize(&self) -> Result<ResolvedConfig, Error> {
        let mut state = ChainState::default();
        for layer in &self.layers {
            layer.apply(&mut state)?;
        }
        Ok(ResolvedConfig {
            name: self.name().to_string(),
            lineage: self.lineage().into_iter().map(String::from).collect(),
            window_size: state.window_size,
            options: state.options,
            overrides: state.log,
        })
    }
}

/// A materialized variant: its final options and how they came to be.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfig {
    pub name: String,
    pub lineage: Vec<String>,
    pub window_size: Option<u32>,
    pub options: OptionSet,
    pub overrides: Vec<Override>,
}

impl ResolvedConfig {
    /// Last layer that wrote `flag`, if any.
    #[must_use]
    pub fn last_writer(&self, flag: &str) -> Option<&str> {
        self.overrides
            .iter()
            .rev()
            .find(|o| o.flag == flag)
            .map(|o| o.layer.as_str())
    }
}
