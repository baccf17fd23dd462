//! CLI command implementations.
//!
//! | Module     | Commands handled                          |
//! |------------|-------------------------------------------|
//! | `serve`    | `Serve`                                   |
//! | `operator` | `InitDb`, `AddOperator`, `HashPassword`   |
//! | `config`   | `Config`                                  |

pub mod config;
pub mod operator;
pub mod serve;

pub use config::cmd_config;
pub use operator::{cmd_add_operator, cmd_hash_password, cmd_init_db};
pub use serve::cmd_serve;
