//! Browser automation boundary
//!
//! The session keeper drives the page only through the narrow [`PageDriver`]
//! contract; [`ChromiumDriver`] implements it over CDP.

mod chromium;
mod driver;
mod errors;

pub use chromium::ChromiumDriver;
pub use driver::PageDriver;
pub use errors::BrowserError;

#[cfg(test)]
pub(crate) use driver::mock;
