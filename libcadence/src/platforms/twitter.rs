//! Twitter/X rules

use super::PlatformRules;
use crate::types::Platform;

pub const RULES: PlatformRules = PlatformRules {
    platform: Platform::Twitter,
    home_url: "https://x.com/home",
    char_limit: 280,
    max_media: 4,
    max_hashtags: 10,
    requires_media: false,
    supports_native_schedule: true,
    session_cookie: "auth_token",
    challenge_markers: &[
        "/account/access",
        "LoginAcid",
        "arkose",
        "captcha",
    ],
};
