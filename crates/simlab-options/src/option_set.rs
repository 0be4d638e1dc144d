use crate::OptionValue;
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;

/// Ordered options for one simulator invocation.
///
/// Rendering order is fixed: direct options, then list flags, then dict
/// entries, each in insertion order. An overwritten dict entry keeps the
/// position of its first insertion.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OptionSet {
    direct: Vec<String>,
    list: IndexSet<String>,
    dict: IndexMap<String, OptionValue>,
}

impl OptionSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_direct<I, S>(&mut self, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.direct.extend(values.into_iter().map(Into::into));
    }

    pub fn add_list<I, S>(&mut self, flags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for flag in flags {
            self.list.insert(flag.into());
        }
    }

    /// Removes list flags. Absent flags are ignored.
    pub fn remove_list<I, S>(&mut self, flags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for flag in flags {
            self.remove_list_flag(flag.as_ref());
        }
    }

    /// Removes one list flag and reports whether it was present.
    pub fn remove_list_flag(&mut self, flag: &str) -> bool {
        let removed = self.list.shift_remove(flag);
        if !removed {
            tracing::debug!(flag, "list flag not present, nothing to remove");
        }
        removed
    }

    pub fn add_dict<I, K, V>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<OptionValue>,
    {
        for (flag, value) in entries {
            self.set_dict(flag, value);
        }
    }

    /// Sets one dict entry, returning the value it replaced.
    pub fn set_dict(
        &mut self,
        flag: impl Into<String>,
        value: impl Into<OptionValue>,
    ) -> Option<OptionValue> {
        self.dict.insert(flag.into(), value.into())
    }

    /// Appends every option of `other`; dict entries of `other` win.
    pub fn merge(&mut self, other: &OptionSet) {
        self.add_direct(other.direct.iter().cloned());
        self.add_list(other.list.iter().cloned());
        self.add_dict(other.dict.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    #[must_use]
    pub fn direct(&self) -> &[String] {
        &self.direct
    }

    pub fn list(&self) -> impl Iterator<Item = &str> + '_ {
        self.list.iter().map(String::as_str)
    }

    pub fn dict(&self) -> impl Iterator<Item = (&str, &OptionValue)> + '_ {
        self.dict.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn has_list(&self, flag: &str) -> bool {
        self.list.contains(flag)
    }

    #[must_use]
    pub fn get(&self, flag: &str) -> Option<&OptionValue> {
        self.dict.get(flag)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.direct.is_empty() && self.list.is_empty() && self.dict.is_empty()
    }

    /// Argument vector in rendering order.
    ///
    /// With `space` a dict entry contributes two arguments (`flag`, `value`),
    /// otherwise one (`flag=value`).
    #[must_use]
    pub fn to_args(&self, space: bool) -> Vec<String> {
        let mut args = Vec::with_capacity(self.direct.len() + self.list.len() + 2 * self.dict.len());
        args.extend(self.direct.iter().cloned());
        args.extend(self.list.iter().cloned());
        for (flag, value) in &self.dict {
            if space {
                args.push(flag.clone());
                args.push(value.to_string());
            } else {
                args.push(format!("{flag}={value}"));
            }
        }
        args
    }

    #[must_use]
    pub fn render(&self, space: bool) -> String {
        self.to_args(space).join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_orders_direct_then_list_then_dict() {
        let mut opts = OptionSet::new();
        opts.add_dict([("--mem-type", "DDR3")]);
        opts.add_list(["--caches"]);
        opts.add_direct(["fs.py"]);
        opts.add_dict([("--l2_assoc", 8)]);
        assert_eq!(
            opts.render(false),
            "fs.py --caches --mem-type=DDR3 --l2_assoc=8"
        );
        assert_eq!(opts.render(true), "fs.py --caches --mem-type DDR3 --l2_assoc 8");
    }

    #[test]
    fn space_style_splits_dict_entries_into_two_args() {
        let mut opts = OptionSet::new();
        opts.add_dict([("-W", "20000000"), ("-i", "/cpt/a.gz")]);
        assert_eq!(opts.to_args(true), vec!["-W", "20000000", "-i", "/cpt/a.gz"]);
        assert_eq!(opts.to_args(false), vec!["-W=20000000", "-i=/cpt/a.gz"]);
    }

    #[test]
    fn list_flags_are_deduplicated_in_first_insertion_order() {
        let mut opts = OptionSet::new();
        opts.add_list(["--caches", "--l2cache", "--caches", "--l3cache"]);
        opts.add_list(["--l2cache"]);
        assert_eq!(
            opts.list().collect::<Vec<_>>(),
            vec!["--caches", "--l2cache", "--l3cache"]
        );
    }

    #[test]
    fn remove_list_is_idempotent_and_keeps_order() {
        let mut opts = OptionSet::new();
        opts.add_list(["--caches", "--l2cache", "--l3cache"]);
        opts.remove_list(["--l2cache"]);
        assert_eq!(opts.list().collect::<Vec<_>>(), vec!["--caches", "--l3cache"]);
        let before = opts.clone();
        opts.remove_list(["--l2cache"]);
        assert_eq!(opts, before);
        assert!(!opts.remove_list_flag("--never-added"));
    }

    #[test]
    fn dict_overwrite_keeps_first_position() {
        let mut opts = OptionSet::new();
        opts.add_dict([("--l1i_size", "32kB"), ("--l2_size", "4MB")]);
        let previous = opts.set_dict("--l1i_size", "64kB");
        assert_eq!(previous, Some(OptionValue::from("32kB")));
        assert_eq!(opts.render(false), "--l1i_size=64kB --l2_size=4MB");
    }

    #[test]
    fn render_is_deterministic() {
        let mut opts = OptionSet::new();
        opts.add_direct(["--debug-flags=Fetch"]);
        opts.add_list(["--caches", "--l2cache"]);
        opts.add_dict([("--num-ROB", 192), ("--num-LQ", 72)]);
        assert_eq!(opts.render(false), opts.clone().render(false));
        assert_eq!(opts.render(true), opts.render(true));
    }

    #[test]
    fn merge_appends_and_overrides() {
        let mut base = OptionSet::new();
        base.add_direct(["fs.py"]);
        base.add_list(["--caches"]);
        base.add_dict([("--mem-type", "DDR3")]);

        let mut delta = OptionSet::new();
        delta.add_list(["--caches", "--l2cache"]);
        delta.add_dict([("--mem-type", "DRAMsim3"), ("--mem-size", "8GB")]);

        base.merge(&delta);
        assert_eq!(
            base.render(false),
            "fs.py --caches --l2cache --mem-type=DRAMsim3 --mem-size=8GB"
        );
    }
}
