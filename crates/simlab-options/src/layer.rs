use crate::chain::{ChainState, OverrideAction};
use crate::{Error, OptionValue};
use indexmap::IndexMap;
use serde::Serialize;

/// One edit a layer performs on the shared option set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Edit {
    /// Sets the window size and recomputes every window-derived entry.
    SetWindowSize { size: u32 },
    AddList { flags: Vec<String> },
    RemoveList { flags: Vec<String> },
    AddDict { entries: IndexMap<String, OptionValue> },
    /// Sets `flag = round(ratio * window_size)` and keeps it tied to the
    /// window size for later resizes.
    Derive { entries: IndexMap<String, f64> },
}

/// A named delta over an optional parent variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigLayer {
    name: String,
    parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    edits: Vec<Edit>,
}

impl ConfigLayer {
    #[must_use]
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            description: None,
            edits: Vec::new(),
        }
    }

    #[must_use]
    pub fn child(name: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            parent: Some(parent.into()),
            ..Self::root(name)
        }
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn window_size(mut self, size: u32) -> Self {
        self.edits.push(Edit::SetWindowSize { size });
        self
    }

    #[must_use]
    pub fn add_list<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.edits.push(Edit::AddList {
            flags: flags.into_iter().map(Into::into).collect(),
        });
        self
    }

    #[must_use]
    pub fn remove_list<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.edits.push(Edit::RemoveList {
            flags: flags.into_iter().map(Into::into).collect(),
        });
        self
    }

    #[must_use]
    pub fn add_dict<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<OptionValue>,
    {
        self.edits.push(Edit::AddDict {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        });
        self
    }

    #[must_use]
    pub fn derive<I, K>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        self.edits.push(Edit::Derive {
            entries: entries.into_iter().map(|(k, r)| (k.into(), r)).collect(),
        });
        self
    }

    pub(crate) fn push_edit(&mut self, edit: Edit) {
        self.edits.push(edit);
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    #[must_use]
    pub fn edits(&self) -> &[Edit] {
        &self.edits
    }

    /// Checks the parts of the layer that do not depend on its ancestors.
    pub fn validate(&self) -> Result<(), Error> {
        for edit in &self.edits {
            match edit {
                Edit::SetWindowSize { size: 0 } => {
                    return Err(Error::ZeroWindowSize {
                        variant: self.name.clone(),
                    })
                }
                Edit::Derive { entries } => {
                    if let Some((flag, ratio)) = entries
                        .iter()
                        .find(|(_, ratio)| !ratio.is_finite() || **ratio < 0.0)
                    {
                        return Err(Error::InvalidRatio {
                            variant: self.name.clone(),
                            flag: flag.clone(),
                            ratio: *ratio,
                        });
                    }
                }
                Edit::AddDict { entries } => {
                    if let Some((flag, value)) = entries.iter().find(|(_, value)| {
                        matches!(value, OptionValue::Float(v) if !v.is_finite())
                    }) {
                        return Err(Error::UnrenderableValue {
                            flag: flag.clone(),
                            kind: format!("non-finite float {value}"),
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub(crate) fn apply(&self, state: &mut ChainState) -> Result<(), Error> {
        tracing::debug!(layer = %self.name, edits = self.edits.len(), "applying config layer");
        for edit in &self.edits {
            match edit {
                Edit::SetWindowSize { size } => {
                    if *size == 0 {
                        return Err(Error::ZeroWindowSize {
                            variant: self.name.clone(),
                        });
                    }
                    state.set_window_size(&self.name, *size);
                }
                Edit::AddList { flags } => {
                    for flag in flags {
                        state.options.add_list([flag.as_str()]);
                        state.record(&self.name, OverrideAction::AddList, flag, None);
                    }
                }
                Edit::RemoveList { flags } => {
                    for flag in flags {
                        if state.options.remove_list_flag(flag) {
                            state.record(&self.name, OverrideAction::RemoveList, flag, None);
                        }
                    }
                }
                Edit::AddDict { entries } => {
                    for (flag, value) in entries {
                        state.set_literal(&self.name, flag, value.clone());
                    }
                }
                Edit::Derive { entries } => {
                    for (flag, ratio) in entries {
                        state.derive(&self.name, flag, *ratio)?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_records_edits_in_authored_order() {
        let layer = ConfigLayer::child("Smarts", "Typical8W")
            .add_dict([("--l2_size", "2MB")])
            .remove_list(["--l3cache"]);
        assert_eq!(layer.parent(), Some("Typical8W"));
        assert!(matches!(layer.edits()[0], Edit::AddDict { .. }));
        assert!(matches!(layer.edits()[1], Edit::RemoveList { .. }));
    }

    #[test]
    fn validate_rejects_zero_window_and_bad_ratio() {
        let err = ConfigLayer::root("Zero").window_size(0).validate().expect_err("zero");
        assert!(matches!(err, Error::ZeroWindowSize { .. }));

        let err = ConfigLayer::root("Neg")
            .window_size(64)
            .derive([("--num-LQ", -0.5)])
            .validate()
            .expect_err("negative ratio");
        assert!(err.to_string().contains("--num-LQ"), "{}", err);

        let err = ConfigLayer::root("Nan")
            .add_dict([("--x", OptionValue::Float(f64::NAN))])
            .validate()
            .expect_err("nan value");
        assert!(matches!(err, Error::UnrenderableValue { .. }));
    }
}
