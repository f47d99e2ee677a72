//! Version and banner information.

pub const PRODUCT_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One-line banner reported through the log listener after a successful
/// worker launch.
pub fn banner() -> String {
    format!(
        "{PRODUCT_NAME} v{VERSION} - {}-{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
