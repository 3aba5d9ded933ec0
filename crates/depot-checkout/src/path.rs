//! Syntactic checks on client supplied paths.
//!
//! Both checks run before any filesystem access, so a rejected path never
//! leaves anything behind.

use std::path::Path;

use crate::{CheckoutError, Result};

/// Characters never allowed anywhere in a path.
const FORBIDDEN_CHARS: &[char] = &['?', '*', ':', ';', '{', '}', '\\'];

/// Validate a checkout ID such as `job1` or `flamenco/job1`.
pub fn validate_checkout_path(path: &str) -> Result<()> {
    check_common(path)
}

/// Validate the path of a file inside a checkout.
pub fn validate_file_path(path: &str) -> Result<()> {
    check_common(path)?;
    if Path::new(path).is_absolute() {
        return Err(CheckoutError::invalid(path, "absolute path"));
    }
    Ok(())
}

fn check_common(path: &str) -> Result<()> {
    let Some(first) = path.chars().next() else {
        return Err(CheckoutError::invalid(path, "empty path"));
    };
    if first == '/' {
        return Err(CheckoutError::invalid(path, "starts with a slash"));
    }
    if path.chars().any(|c| FORBIDDEN_CHARS.contains(&c)) {
        return Err(CheckoutError::invalid(path, "forbidden character"));
    }
    if path.chars().any(char::is_control) {
        return Err(CheckoutError::invalid(path, "control character"));
    }

    // One ID names exactly one directory; `{id}-{suffix}` is its sibling.
    for segment in path.split('/') {
        match segment {
            "" => return Err(CheckoutError::invalid(path, "empty path segment")),
            "." => return Err(CheckoutError::invalid(path, "current directory segment")),
            ".." => return Err(CheckoutError::invalid(path, "parent directory traversal")),
            _ => {}
        }
    }
    if Path::new(path).has_root() {
        return Err(CheckoutError::invalid(path, "absolute path"));
    }
    Ok(())
}
