//! Logging facade: routes through `log` by default, or `defmt` when the
//! `log-defmt`/`defmt-default` features are active.

#[cfg(not(feature = "log-defmt"))]
pub use log::{debug, error, info, trace, warn};

#[cfg(feature = "log-defmt")]
pub use defmt::{debug, error, info, trace, warn};
