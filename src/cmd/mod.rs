//! CLI command implementations.
//!
//! | Module      | Commands handled |
//! |-------------|------------------|
//! | `run`       | `Run`            |
//! | `dashboard` | `Dashboard`      |
//! | `status`    | `Status`         |

pub mod dashboard;
pub mod run;
pub mod status;

pub use dashboard::cmd_dashboard;
pub use run::cmd_run;
pub use status::cmd_status;
