//! CLI command implementations.
//!
//! | Module       | Commands handled       |
//! |--------------|------------------------|
//! | `scrape`     | `Scrape`               |
//! | `status`     | `Status`               |
//! | `maintain`   | `Repair`, `Housekeep`  |

pub mod maintain;
pub mod scrape;
pub mod status;

pub use maintain::{cmd_housekeep, cmd_repair};
pub use scrape::cmd_scrape;
pub use status::cmd_status;
