//! Simulator option sets and the layered configuration model that produces them.
//!
//! A concrete microarchitecture variant is a chain of [`ConfigLayer`]s, each a
//! delta over its parent. Resolving a variant through the [`Registry`] yields a
//! [`ConfigChain`], and materializing the chain applies every layer root-first
//! to one fresh [`OptionSet`].

mod builtin;
pub mod chain;
pub mod layer;
pub mod option_set;
pub mod registry;
pub mod value;

pub use chain::{ConfigChain, Override, OverrideAction, ResolvedConfig};
pub use layer::{ConfigLayer, Edit};
pub use option_set::OptionSet;
pub use registry::Registry;
pub use value::OptionValue;

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown config variant '{name}' (known variants: {})", .known.join(", "))]
    UnknownVariant { name: String, known: Vec<String> },

    #[error("variant '{variant}' names unknown parent '{parent}'")]
    UnknownParent { variant: String, parent: String },

    #[error("variant '{0}' is already registered")]
    DuplicateVariant(String),

    #[error("parent chain of variant '{0}' does not terminate")]
    Cycle(String),

    #[error("option '{flag}' has a value that cannot be rendered: {kind}")]
    UnrenderableValue { flag: String, kind: String },

    #[error("variant '{variant}' sets a window size of zero")]
    ZeroWindowSize { variant: String },

    #[error("variant '{variant}' derives '{flag}' with invalid ratio {ratio}")]
    InvalidRatio {
        variant: String,
        flag: String,
        ratio: f64,
    },

    #[error("variant '{variant}' derives '{flag}' from the window size, but no window size is set")]
    MissingWindowSize { variant: String, flag: String },

    #[error("failed to read layer file {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse layer file {}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}
