use crate::models::{Fields, Kind, Record};
use crate::store::{Store, StoreError};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

const USERNAMES_INDEX: &str = "usernames";
const TOKENS_INDEX: &str = "tokens";

const USERNAME_FIELD: &str = "username";
const HASHED_PASSWORD_FIELD: &str = "hashed_password";
const TOKEN_FIELD: &str = "token";
const IS_ADMIN_FIELD: &str = "is_admin";

/// An account as the rest of the crate sees it. The hash stays in the store.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub is_admin: bool,
}

impl User {
    fn from_record(record: &Record) -> Self {
        User {
            id: record.id,
            name: record.field_str(USERNAME_FIELD).unwrap_or_default().to_string(),
            is_admin: record
                .fields
                .get(IS_ADMIN_FIELD)
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

pub struct NewUser<'a> {
    pub name: &'a str,
    pub password: &'a str,
    pub is_admin: bool,
}

#[derive(Error, Debug)]
pub enum UserHashingError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Hash(#[from] argon2::Error),
}

pub fn get_user(store: &dyn Store, id: Uuid) -> Result<Option<User>, StoreError> {
    Ok(store
        .get(Kind::User.namespace(), id)?
        .map(|record| User::from_record(&record)))
}

pub fn get_user_by_name(store: &dyn Store, name: &str) -> Result<Option<User>, StoreError> {
    match store.index_get(USERNAMES_INDEX, name)? {
        Some(id) => get_user(store, id),
        None => Ok(None),
    }
}

pub fn get_user_by_token(store: &dyn Store, token: &str) -> Result<Option<User>, StoreError> {
    match store.index_get(TOKENS_INDEX, token)? {
        Some(id) => get_user(store, id),
        None => Ok(None),
    }
}

/// `None` when no such user, otherwise whether the password matches.
pub fn check_matching_password(
    store: &dyn Store,
    secret_hash_key: &[u8],
    name: &str,
    password: &str,
) -> Result<Option<bool>, UserHashingError> {
    let id = match store.index_get(USERNAMES_INDEX, name)? {
        Some(id) => id,
        None => return Ok(None),
    };
    let record = match store.get(Kind::User.namespace(), id)? {
        Some(record) => record,
        None => return Ok(None),
    };
    let hashed_password = record.field_str(HASHED_PASSWORD_FIELD).unwrap_or_default();
    Ok(Some(argon2::verify_encoded_ext(
        hashed_password,
        password.as_bytes(),
        secret_hash_key,
        &[],
    )?))
}

fn hash_password(password: &str, secret_hash_key: &[u8]) -> Result<String, argon2::Error> {
    let config = argon2::Config {
        secret: secret_hash_key,
        ..argon2::Config::default()
    };
    let salt = Uuid::new_v4();
    argon2::hash_encoded(password.as_bytes(), salt.as_bytes(), &config)
}

/// Inserts the user unless the name is already taken, in which case the
/// existing account is returned untouched. The returned flag tells which.
pub fn insert_new_user(
    store: &dyn Store,
    secret_hash_key: &[u8],
    new_user: NewUser,
) -> Result<(User, bool), UserHashingError> {
    let NewUser {
        name,
        password,
        is_admin,
    } = new_user;

    let hashed_password = hash_password(password, secret_hash_key)?;

    let mut fields = Fields::new();
    fields.insert(USERNAME_FIELD.into(), Value::from(name));
    fields.insert(HASHED_PASSWORD_FIELD.into(), Value::from(hashed_password));
    fields.insert(IS_ADMIN_FIELD.into(), Value::from(is_admin));
    let mut record = Record::new(None, fields);
    record.owner = Some(record.id);

    // The record goes in before the name is claimed, so a claimed name always
    // points at a stored user.
    let user = User::from_record(&record);
    store.insert(Kind::User.namespace(), record)?;

    let claimed = store.index_claim(USERNAMES_INDEX, name, user.id)?;
    if claimed != user.id {
        store.remove(Kind::User.namespace(), user.id)?;
        return match get_user(store, claimed)? {
            Some(existing) => Ok((existing, false)),
            None => Err(StoreError::Unavailable(format!(
                "username '{}' is claimed by a missing user",
                name
            ))
            .into()),
        };
    }
    Ok((user, true))
}

/// The user's current token, minting one if none was issued yet.
pub fn issue_token(store: &dyn Store, id: Uuid) -> Result<Option<String>, StoreError> {
    let current = store
        .get(Kind::User.namespace(), id)?
        .and_then(|record| record.field_str(TOKEN_FIELD).map(str::to_string));
    match current {
        Some(token) => Ok(Some(token)),
        None => regenerate_token(store, id),
    }
}

/// Replaces the user's token; the previous one stops authenticating.
pub fn regenerate_token(store: &dyn Store, id: Uuid) -> Result<Option<String>, StoreError> {
    let token = Uuid::new_v4().simple().to_string();
    let mut previous = None;
    let updated = store.modify(Kind::User.namespace(), id, &mut |record| {
        previous = record
            .fields
            .insert(TOKEN_FIELD.into(), Value::from(token.clone()));
    })?;
    if updated.is_none() {
        return Ok(None);
    }
    store.index_claim(TOKENS_INDEX, &token, id)?;
    if let Some(Value::String(previous)) = previous {
        store.index_remove(TOKENS_INDEX, &previous)?;
    }
    Ok(Some(token))
}
