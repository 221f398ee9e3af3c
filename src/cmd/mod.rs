//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `track`  | `Track`          |
//! | `assign` | `Assign`         |
//! | `id`     | `Id`             |
//! | `serve`  | `Serve`          |
//! | `config` | `Config`         |

pub mod assign;
pub mod config;
pub mod id;
pub mod serve;
pub mod track;

pub use assign::cmd_assign;
pub use config::cmd_config;
pub use id::cmd_id;
pub use serve::cmd_serve;
pub use track::cmd_track;
