pub mod config;
pub mod identity;
pub mod types;

pub use config::Config;
pub use identity::{canonicalize, clean_tracking_params, content_hash16, extract_first_url, resolve};
pub use types::{CanonicalReference, InputKind, Mode};
