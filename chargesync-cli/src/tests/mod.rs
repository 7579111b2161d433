//! Shared test harness modules for the chargesync CLI.

use super::*;

mod commands;
mod helpers;
