use diesel::prelude::*;
use diesel::PgConnection;
use thiserror::Error;

use crate::auth::password;
use crate::models::{NewUser, User};
use crate::schema::users;

#[derive(Debug, Error)]
pub enum UserError {
    #[error("user already exists")]
    Exists,
    #[error("user not found")]
    NotFound,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

pub fn create(conn: &mut PgConnection, id: &str, plain_password: &str) -> Result<User, UserError> {
    let exists: i64 = users::table
        .filter(users::id.eq(id))
        .count()
        .get_result(conn)?;
    if exists > 0 {
        return Err(UserError::Exists);
    }

    let password_hash =
        password::hash_password(plain_password).map_err(|err| UserError::Hash(err.to_string()))?;

    diesel::insert_into(users::table)
        .values(&NewUser {
            id: id.to_string(),
            password_hash,
        })
        .execute(conn)?;

    get(conn, id)
}

pub fn get(conn: &mut PgConnection, id: &str) -> Result<User, UserError> {
    users::table
        .filter(users::id.eq(id))
        .filter(users::deleted_at.is_null())
        .first(conn)
        .optional()?
        .ok_or(UserError::NotFound)
}

pub fn login(conn: &mut PgConnection, id: &str, plain_password: &str) -> Result<User, UserError> {
    let user = get(conn, id)?;

    let valid = password::verify_password(plain_password, &user.password_hash)
        .map_err(|_| UserError::InvalidCredentials)?;
    if !valid {
        return Err(UserError::InvalidCredentials);
    }

    Ok(user)
}

pub fn change_password(
    conn: &mut PgConnection,
    id: &str,
    current_password: &str,
    new_password: &str,
) -> Result<(), UserError> {
    let user = login(conn, id, current_password)?;

    let password_hash =
        password::hash_password(new_password).map_err(|err| UserError::Hash(err.to_string()))?;

    diesel::update(users::table.find(&user.id))
        .set(users::password_hash.eq(password_hash))
        .execute(conn)?;

    Ok(())
}
