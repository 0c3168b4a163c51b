use tables::parameters::{AccessLevel, DataType, Parameter};

pub const ALLOWED_LOGGED_IN_ATTEMPTS: &str = "ALLOWED_LOGGED_IN_ATTEMPTS";
pub const ALLOWED_LOGGED_IN_ATTEMPTS_RESET: &str = "ALLOWED_LOGGED_IN_ATTEMPTS_RESET";
pub const MAX_TEMPORARY_BLOCK: &str = "MAX_TEMPORARY_BLOCK";
pub const TEMPORARY_BLOCK_PERIOD: &str = "TEMPORARY_BLOCK_PERIOD";
pub const TIME_OUT_PERIOD: &str = "TIME_OUT_PERIOD";
pub const BETWEEN_POST_REQUESTS_TIME: &str = "BETWEEN_POST_REQUESTS_TIME";
pub const MAGIC_NUMBER: &str = "MAGIC_NUMBER";
pub const MEMBERSHIP_EXPIRE_PERIOD: &str = "MEMBERSHIP_EXPIRE_PERIOD";
pub const THREE_CHARACTER_PREFIX_FOR_MEMBERSHIP: &str = "THREE_CHARACTER_PREFIX_FOR_MEMBERSHIP";
pub const MEMBER_FORM_POST_LIMIT: &str = "MEMBER_FORM_POST_LIMIT";
pub const DONATION_POST_LIMIT: &str = "DONATION_POST_LIMIT";
pub const IMAGE_MAX_SIZE: &str = "IMAGE_MAX_SIZE";
pub const OPEN_MEMBER_REGISTRATION_FORM: &str = "OPEN_MEMBER_REGISTRATION_FORM";
pub const REQUEST_MAX_LIMIT_PER_SECOND: &str = "REQUEST_MAX_LIMIT_PER_SECOND";
/// Answers from the default table without being seeded or logged as missing.
pub const TEST: &str = "TEST";

#[derive(Debug, Clone, Copy)]
pub struct ParameterDefault {
    pub name: &'static str,
    pub value: &'static str,
    pub access_level: AccessLevel,
    pub data_type: DataType,
    pub description: &'static str,
}

impl ParameterDefault {
    pub fn to_parameter(&self) -> Parameter {
        Parameter::new(
            self.name,
            self.value,
            self.access_level,
            self.data_type,
            self.description,
        )
    }
}

const fn admin(
    name: &'static str,
    value: &'static str,
    data_type: DataType,
    description: &'static str,
) -> ParameterDefault {
    ParameterDefault {
        name,
        value,
        access_level: AccessLevel::Admin,
        data_type,
        description,
    }
}

const fn system(name: &'static str, value: &'static str, data_type: DataType) -> ParameterDefault {
    ParameterDefault {
        name,
        value,
        access_level: AccessLevel::None,
        data_type,
        description: "Controlled by the system only.",
    }
}

pub const DEFAULTS: &[ParameterDefault] = &[
    admin(
        ALLOWED_LOGGED_IN_ATTEMPTS,
        "5",
        DataType::Integer,
        "Failed logins allowed inside the reset window before the client is blocked.",
    ),
    admin(
        ALLOWED_LOGGED_IN_ATTEMPTS_RESET,
        "1",
        DataType::Integer,
        "Length in days of the failed-login window.",
    ),
    admin(
        MAX_TEMPORARY_BLOCK,
        "5",
        DataType::Integer,
        "Temporary blocks a client may collect before the next one is indefinite.",
    ),
    admin(
        TEMPORARY_BLOCK_PERIOD,
        "1",
        DataType::Integer,
        "Days a temporary block lasts.",
    ),
    admin(
        TIME_OUT_PERIOD,
        "1440",
        DataType::Integer,
        "Minutes after login before the session times out.",
    ),
    admin(
        BETWEEN_POST_REQUESTS_TIME,
        "500",
        DataType::Integer,
        "Milliseconds a client has to wait between two POST requests.",
    ),
    system(MAGIC_NUMBER, "1", DataType::Integer),
    admin(
        MEMBERSHIP_EXPIRE_PERIOD,
        "2",
        DataType::Integer,
        "Years a membership stays valid.",
    ),
    admin(
        THREE_CHARACTER_PREFIX_FOR_MEMBERSHIP,
        "YEM",
        DataType::String,
        "Prefix of generated membership numbers.",
    ),
    admin(
        MEMBER_FORM_POST_LIMIT,
        "1",
        DataType::Integer,
        "Member form submissions allowed per client inside the reset window.",
    ),
    admin(
        DONATION_POST_LIMIT,
        "5",
        DataType::Integer,
        "Donation submissions allowed per client per day.",
    ),
    admin(
        IMAGE_MAX_SIZE,
        "4",
        DataType::Integer,
        "Largest accepted image upload in megabytes.",
    ),
    admin(
        OPEN_MEMBER_REGISTRATION_FORM,
        "YES",
        DataType::Boolean,
        "Whether the member registration form accepts submissions.",
    ),
    system(REQUEST_MAX_LIMIT_PER_SECOND, "50", DataType::Integer),
    system(TEST, "TEST_PARAMETER", DataType::String),
];

pub fn lookup(name: &str) -> Option<&'static ParameterDefault> {
    DEFAULTS.iter().find(|default| default.name == name)
}

/// Every default that belongs in storage.
pub fn seedable() -> impl Iterator<Item = &'static ParameterDefault> {
    DEFAULTS.iter().filter(|default| default.name != TEST)
}
