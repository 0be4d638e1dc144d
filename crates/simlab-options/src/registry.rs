use crate::layer::Edit;
use crate::{ConfigChain, ConfigLayer, Error, OptionValue};
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::Path;

/// Named variants, each registered after its parent.
///
/// Because a layer can only be registered once its parent is known, every
/// parent chain is finite and acyclic.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    layers: IndexMap<String, ConfigLayer>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LayerFile {
    variants: Vec<LayerSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LayerSpec {
    name: String,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    window_size: Option<u32>,
    #[serde(default)]
    remove_list: Vec<String>,
    #[serde(default)]
    add_list: Vec<String>,
    #[serde(default)]
    add_dict: IndexMap<String, serde_yaml::Value>,
    #[serde(default)]
    derive: IndexMap<String, f64>,
}

impl LayerSpec {
    fn into_layer(self) -> Result<ConfigLayer, Error> {
        let mut layer = match self.parent {
            Some(parent) => ConfigLayer::child(self.name, parent),
            None => ConfigLayer::root(self.name),
        };
        if let Some(description) = self.description {
            layer = layer.describe(description);
        }
        if let Some(size) = self.window_size {
            layer.push_edit(Edit::SetWindowSize { size });
        }
        if !self.remove_list.is_empty() {
            layer.push_edit(Edit::RemoveList {
                flags: self.remove_list,
            });
        }
        if !self.add_list.is_empty() {
            layer.push_edit(Edit::AddList {
                flags: self.add_list,
            });
        }
        if !self.add_dict.is_empty() {
            let entries = self
                .add_dict
                .iter()
                .map(|(flag, value)| Ok((flag.clone(), OptionValue::from_yaml(flag, value)?)))
                .collect::<Result<IndexMap<_, _>, Error>>()?;
            layer.push_edit(Edit::AddDict { entries });
        }
        if !self.derive.is_empty() {
            layer.push_edit(Edit::Derive {
                entries: self.derive,
            });
        }
        Ok(layer)
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in microarchitecture variants.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for layer in crate::builtin::layers() {
            registry.layers.insert(layer.name().to_string(), layer);
        }
        registry
    }

    pub fn register(&mut self, layer: ConfigLayer) -> Result<(), Error> {
        if self.layers.contains_key(layer.name()) {
            return Err(Error::DuplicateVariant(layer.name().to_string()));
        }
        if let Some(parent) = layer.parent() {
            if !self.layers.contains_key(parent) {
                return Err(Error::UnknownParent {
                    variant: layer.name().to_string(),
                    parent: parent.to_string(),
                });
            }
        }
        layer.validate()?;
        tracing::debug!(variant = layer.name(), parent = ?layer.parent(), "registered config variant");
        self.layers.insert(layer.name().to_string(), layer);
        Ok(())
    }

    /// Registers every variant of a YAML layer file, in file order.
    ///
    /// Nothing is registered when any variant of the file is invalid.
    pub fn load_yaml(&mut self, text: &str, path: &Path) -> Result<usize, Error> {
        let file: LayerFile = serde_yaml::from_str(text).map_err(|source| Error::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        let mut staged = self.clone();
        let count = file.variants.len();
        for spec in file.variants {
            staged.register(spec.into_layer()?)?;
        }
        *self = staged;
        Ok(count)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<usize, Error> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.load_yaml(&text, path)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ConfigLayer> {
        self.layers.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.layers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.layers.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Resolves `name` into its root-to-leaf chain.
    pub fn resolve(&self, name: &str) -> Result<ConfigChain<'_>, Error> {
        let leaf = self.layers.get(name).ok_or_else(|| Error::UnknownVariant {
            name: name.to_string(),
            known: self.names().map(String::from).collect(),
        })?;
        let mut layers = vec![leaf];
        let mut current = leaf;
        while let Some(parent) = current.parent() {
            if layers.len() > self.layers.len() {
                return Err(Error::Cycle(name.to_string()));
            }
            current = self.layers.get(parent).ok_or_else(|| Error::UnknownParent {
                variant: current.name().to_string(),
                parent: parent.to_string(),
            })?;
            layers.push(current);
        }
        layers.reverse();
        Ok(ConfigChain::new(layers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parent_must_be_registered_first() {
        let mut registry = Registry::new();
        let err = registry
            .register(ConfigLayer::child("child", "root"))
            .expect_err("parent missing");
        assert!(matches!(err, Error::UnknownParent { .. }));

        registry.register(ConfigLayer::root("root")).unwrap();
        registry.register(ConfigLayer::child("child", "root")).unwrap();
        let err = registry
            .register(ConfigLayer::root("child"))
            .expect_err("duplicate");
        assert!(matches!(err, Error::DuplicateVariant(_)));
    }

    #[test]
    fn unknown_variant_lists_known_names() {
        let mut registry = Registry::new();
        registry.register(ConfigLayer::root("NanhuNoL3")).unwrap();
        let err = registry.resolve("Nanhoo").expect_err("unknown");
        let msg = err.to_string();
        assert!(msg.contains("Nanhoo"), "{}", msg);
        assert!(msg.contains("NanhuNoL3"), "{}", msg);
    }

    #[test]
    fn resolve_orders_root_first() {
        let mut registry = Registry::new();
        registry.register(ConfigLayer::root("a")).unwrap();
        registry.register(ConfigLayer::child("b", "a")).unwrap();
        registry.register(ConfigLayer::child("c", "b")).unwrap();
        let chain = registry.resolve("c").unwrap();
        assert_eq!(chain.lineage(), vec!["a", "b", "c"]);
        assert_eq!(chain.name(), "c");
    }

    #[test]
    fn yaml_layers_extend_builtin_variants() {
        let mut registry = Registry::builtin();
        let yaml = r"
variants:
  - name: NanhuBigL2
    parent: NanhuConfig
    add_dict:
      --l2_size: 2MB
      --l2_assoc: 16
    remove_list: [--l3cache]
  - name: NanhuBigL2Wide
    parent: NanhuBigL2
    window_size: 256
    derive:
      --num-ROB: 1.0
";
        let count = registry
            .load_yaml(yaml, &PathBuf::from("layers.yaml"))
            .unwrap();
        assert_eq!(count, 2);

        let resolved = registry.resolve("NanhuBigL2Wide").unwrap().materialize().unwrap();
        let rendered = resolved.options.render(false);
        assert!(rendered.contains("--l2_size=2MB"), "{}", rendered);
        assert!(rendered.contains("--l2_assoc=16"), "{}", rendered);
        assert!(rendered.contains("--num-ROB=256"), "{}", rendered);
        assert!(!rendered.contains("--l3cache"), "{}", rendered);
    }

    #[test]
    fn invalid_yaml_layer_registers_nothing() {
        let mut registry = Registry::builtin();
        let before = registry.len();
        let yaml = r"
variants:
  - name: Good
    parent: NanhuConfig
  - name: Bad
    parent: NanhuConfig
    add_dict:
      --l2_size: [1, 2]
";
        let err = registry
            .load_yaml(yaml, &PathBuf::from("layers.yaml"))
            .expect_err("sequence value");
        assert!(matches!(err, Error::UnrenderableValue { .. }));
        assert_eq!(registry.len(), before);
        assert!(!registry.contains("Good"));
    }

    #[test]
    fn unknown_yaml_field_is_rejected() {
        let mut registry = Registry::new();
        let yaml = "variants:\n  - name: x\n    add_dcit: {}\n";
        let err = registry
            .load_yaml(yaml, &PathBuf::from("typo.yaml"))
            .expect_err("typo");
        assert!(err.to_string().contains("typo.yaml"), "{}", err);
    }
}
