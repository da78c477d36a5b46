//! The closed set of provider variants.

pub mod mandrill;
pub mod resend;
pub mod telegram;
pub mod webhook;
