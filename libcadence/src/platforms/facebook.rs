//! Facebook rules

use super::PlatformRules;
use crate::types::Platform;

pub const RULES: PlatformRules = PlatformRules {
    platform: Platform::Facebook,
    home_url: "https://www.facebook.com/",
    char_limit: 63_206,
    max_media: 10,
    max_hashtags: 30,
    requires_media: false,
    supports_native_schedule: true,
    session_cookie: "c_user",
    challenge_markers: &[
        "/checkpoint/",
        "two_step_verification",
        "captcha",
        "login/identify",
    ],
};
