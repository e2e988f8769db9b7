mod rate;
mod time;

pub(crate) use rate::RateCounter;
pub(crate) use time::{already_happened, unix_ms, InstantExt};
