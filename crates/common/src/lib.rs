pub mod config;
pub mod error;
pub mod request;

pub use config::{
    AppConfig, CellConfig, FilterSpec, LiveConfig, RecipeConfig, TrieConfig,
};
pub use error::{CidrwatchError, CidrwatchResult};
pub use request::{Method, Request};
