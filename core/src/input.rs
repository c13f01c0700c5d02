/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::path::{Component, Path};

use super::consts::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },
    #[error("{kind} `{value}` must be a single path component")]
    NotAComponent { kind: &'static str, value: String },
    #[error("{kind} `{value}` contains a control character")]
    ControlCharacter { kind: &'static str, value: String },
}

pub fn port_in_range(s: &str) -> Result<u16, String> {
    let port: usize = s
        .parse()
        .map_err(|_| format!("`{s}` is not a port number"))?;

    if PORT_RANGE.contains(&port) {
        Ok(port as u16)
    } else {
        Err(format!(
            "port not in range {}-{}",
            PORT_RANGE.start(),
            PORT_RANGE.end()
        ))
    }
}

pub fn greater_than_zero<
    T: std::str::FromStr + std::cmp::PartialOrd + std::fmt::Display + Default,
>(
    s: &str,
) -> Result<T, String> {
    let num: T = s
        .parse()
        .map_err(|_| format!("`{}` is not a valid number", s))?;

    if num > T::default() {
        Ok(num)
    } else {
        Err(format!("`{}` is not larger than 0", s))
    }
}

/// Checks that a peer supplied name (request id, platform, basename) can be
/// used as exactly one directory entry below the builds root.
pub fn validate_segment<'a>(kind: &'static str, value: &'a str) -> Result<&'a str, InputError> {
    if value.is_empty() {
        return Err(InputError::Empty { kind });
    }

    if value.chars().any(char::is_control) {
        return Err(InputError::ControlCharacter {
            kind,
            value: value.to_string(),
        });
    }

    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == value => Ok(value),
        _ => Err(InputError::NotAComponent {
            kind,
            value: value.to_string(),
        }),
    }
}

/// Splits a `platforms` list into concrete names, expanding
/// [`AUTODETECT_PLATFORM`] to `supported`.
pub fn resolve_platforms<I>(requested: &[String], supported: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    if requested.iter().any(|p| p == AUTODETECT_PLATFORM) {
        return supported.into_iter().collect();
    }

    requested.to_vec()
}
