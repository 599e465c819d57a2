#![allow(
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::ignored_unit_patterns
)]

pub mod action;
pub mod conference;
pub mod config;
pub mod daemon;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod led;
pub mod relay;
pub mod retry;
pub mod state;
pub mod update;
