use nanoid::nanoid;

/// Length of every opaque identifier in the system: device ids, device auth
/// tokens, message external ids and token jtis all share this convention.
pub const ID_LENGTH: usize = 21;

pub fn new_id() -> String {
    nanoid!(ID_LENGTH)
}

/// Credentials for a self-registered user: a short upper-cased login and the
/// remainder of the id as the password.
pub fn new_user_credentials() -> (String, String) {
    let id = nanoid!(ID_LENGTH);
    let login = id[..6].to_uppercase();
    let password = id[7..].to_lowercase();
    (login, password)
}
