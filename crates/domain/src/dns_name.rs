/// Strips a single trailing dot from a domain name.
///
/// Correlation keys are derived from the lowercased result, so
/// "Example.COM." and "example.com" map to the same in-flight query.
pub fn trim_trailing_dot(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}
