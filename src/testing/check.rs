//! Scenario-level assertions
//!
//! Each helper returns `Error::Assertion` instead of panicking so a failed
//! expectation fails only the current scenario and teardown still runs.

use std::fmt::Debug;

use crate::common::{Error, Result};

pub fn ensure_eq<T: PartialEq + Debug>(what: &str, actual: T, expected: T) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Assertion(format!(
            "{}: expected {:?}, got {:?}",
            what, expected, actual
        )))
    }
}

pub fn ensure_ne<T: PartialEq + Debug>(what: &str, actual: T, unexpected: T) -> Result<()> {
    if actual != unexpected {
        Ok(())
    } else {
        Err(Error::Assertion(format!(
            "{}: expected anything but {:?}",
            what, unexpected
        )))
    }
}

pub fn ensure_lt<T: PartialOrd + Debug>(what: &str, actual: T, bound: T) -> Result<()> {
    if actual < bound {
        Ok(())
    } else {
        Err(Error::Assertion(format!(
            "{}: expected less than {:?}, got {:?}",
            what, bound, actual
        )))
    }
}

pub fn ensure_contains(what: &str, text: &str, needle: &str) -> Result<()> {
    if text.contains(needle) {
        Ok(())
    } else {
        Err(Error::Assertion(format!(
            "{}: expected {:?} in output:\n{}",
            what, needle, text
        )))
    }
}

pub fn ensure_not_contains(what: &str, text: &str, needle: &str) -> Result<()> {
    if text.contains(needle) {
        Err(Error::Assertion(format!(
            "{}: unexpected {:?} in output:\n{}",
            what, needle, text
        )))
    } else {
        Ok(())
    }
}

/// `needle` must occur exactly `expected` times
pub fn ensure_count(what: &str, text: &str, needle: &str, expected: usize) -> Result<()> {
    let found = text.matches(needle).count();
    if found == expected {
        Ok(())
    } else {
        Err(Error::Assertion(format!(
            "{}: expected {:?} {} time(s), found {} in output:\n{}",
            what, needle, expected, found, text
        )))
    }
}
