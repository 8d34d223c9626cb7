//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `run`    | `Run`            |
//! | `ci`     | `Ci`             |
//! | `config` | `Config`         |

pub mod ci;
pub mod config;
pub mod run;
pub mod serve;

pub use ci::cmd_ci;
pub use config::cmd_config;
pub use run::{RunOverrides, cmd_run};
pub use serve::cmd_serve;
