//! Operation names understood by the Access API dispatcher.

pub const CREATE: &str = "create";
pub const GET: &str = "get";
pub const LIST: &str = "list";
pub const ATTACH_ADVISORY: &str = "attach_advisory";
pub const SET_EXPLANATION: &str = "set_explanation";
pub const PUT_ATTACHMENT: &str = "put_attachment";
pub const FETCH_ATTACHMENT: &str = "fetch_attachment";
pub const HEAD_ATTACHMENT: &str = "head_attachment";
pub const VERIFY_ATTACHMENT: &str = "verify_attachment";
pub const SIGN_URL: &str = "sign_url";
pub const DIFF: &str = "diff";

/// All known operations.
pub const ALL: &[&str] = &[
    CREATE,
    GET,
    LIST,
    ATTACH_ADVISORY,
    SET_EXPLANATION,
    PUT_ATTACHMENT,
    FETCH_ATTACHMENT,
    HEAD_ATTACHMENT,
    VERIFY_ATTACHMENT,
    SIGN_URL,
    DIFF,
];
