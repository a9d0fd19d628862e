//! Fixtures, end-to-end tests and the `mallard` command line tool.

pub mod test_util;
