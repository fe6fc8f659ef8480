use crate::error::{Error, Result};
use crate::models::user::{self, NewUser, User, UserHashingError};
use crate::models::{Kind, Operation, Record};
use crate::registry::Server;
use crate::store::Store;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;
use std::sync::Arc;
use uuid::Uuid;

/// An authenticated caller.
pub type Identity = User;

/// What a client presented to prove who it is.
#[derive(Clone, Debug, PartialEq)]
pub enum Credentials {
    Password { name: String, password: String },
    Token(String),
}

impl Credentials {
    /// Parses an `Authorization` header value.
    ///
    /// Basic credentials with an empty password carry a token in the username
    /// slot, the same as a Bearer header.
    pub fn from_authorization(header: &str) -> Result<Credentials> {
        let header = header.trim();
        let (scheme, value) = match header.find(' ') {
            Some(i) => (&header[..i], header[i..].trim()),
            None => return Err(Error::malformed("authorization header has no scheme")),
        };

        if scheme.eq_ignore_ascii_case("bearer") {
            if value.is_empty() {
                return Err(Error::malformed("empty bearer token"));
            }
            return Ok(Credentials::Token(value.to_string()));
        }
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(Error::malformed(format!(
                "unsupported authorization scheme '{}'",
                scheme
            )));
        }

        let decoded = STANDARD
            .decode(value)
            .map_err(|e| Error::malformed(format!("bad basic credentials: {}", e)))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| Error::malformed("basic credentials are not UTF-8"))?;
        let (name, password) = match decoded.find(':') {
            Some(i) => (&decoded[..i], &decoded[i + 1..]),
            None => return Err(Error::malformed("basic credentials lack a ':'")),
        };

        if password.is_empty() {
            Ok(Credentials::Token(name.to_string()))
        } else {
            Ok(Credentials::Password {
                name: name.to_string(),
                password: password.to_string(),
            })
        }
    }
}

impl From<UserHashingError> for Error {
    fn from(e: UserHashingError) -> Self {
        match e {
            UserHashingError::Store(e) => Error::Store(e),
            UserHashingError::Hash(e) => Error::Hash(e),
        }
    }
}

/// Only these names can be signed up implicitly.
pub fn is_valid_username(name: &str) -> bool {
    lazy_static! {
        static ref USERNAME_REGEX: Regex = Regex::new(r"^[A-Za-z0-9_.@-]{1,64}$").unwrap();
    }
    USERNAME_REGEX.is_match(name)
}

/// Credential verification and token issuance against the user records.
#[derive(Clone)]
pub struct Auth {
    store: Arc<dyn Store>,
    secret_hash_key: Arc<[u8]>,
}

impl Auth {
    pub fn new(store: Arc<dyn Store>, secret_hash_key: &[u8]) -> Self {
        Auth {
            store,
            secret_hash_key: secret_hash_key.into(),
        }
    }

    pub fn verify(&self, credentials: &Credentials) -> Result<Identity> {
        match credentials {
            Credentials::Password { name, password } => self.verify_password(name, password),
            Credentials::Token(token) => self.verify_token(token),
        }
    }

    fn verify_password(&self, name: &str, password: &str) -> Result<Identity> {
        let store = &*self.store;
        match user::check_matching_password(store, &self.secret_hash_key, name, password)? {
            Some(true) => user::get_user_by_name(store, name)?.ok_or(Error::AuthenticationRejected),
            Some(false) => {
                debug!("Wrong password for {}", name);
                Err(Error::AuthenticationRejected)
            }
            None => self.sign_up(name, password),
        }
    }

    /// First password login for an unknown name creates the account.
    fn sign_up(&self, name: &str, password: &str) -> Result<Identity> {
        if !is_valid_username(name) {
            debug!("Refusing to sign up {:?}", name);
            return Err(Error::AuthenticationRejected);
        }
        let store = &*self.store;
        let (user, created) = user::insert_new_user(
            store,
            &self.secret_hash_key,
            NewUser {
                name,
                password,
                is_admin: false,
            },
        )?;
        if created {
            info!("Signed up {} as {}", name, user.id);
            return Ok(user);
        }
        // Someone else signed this name up first; hold us to their password.
        match user::check_matching_password(store, &self.secret_hash_key, name, password)? {
            Some(true) => Ok(user),
            _ => Err(Error::AuthenticationRejected),
        }
    }

    fn verify_token(&self, token: &str) -> Result<Identity> {
        user::get_user_by_token(&*self.store, token)?.ok_or(Error::AuthenticationRejected)
    }

    /// The caller's current token, minted on first request.
    pub fn token(&self, identity: &Identity) -> Result<String> {
        user::issue_token(&*self.store, identity.id)?
            .ok_or_else(|| Error::NotFound(format!("user {}", identity.id)))
    }

    pub fn regenerate_token(&self, identity: &Identity) -> Result<String> {
        let token = user::regenerate_token(&*self.store, identity.id)?
            .ok_or_else(|| Error::NotFound(format!("user {}", identity.id)))?;
        info!("Regenerated token for {}", identity.name);
        Ok(token)
    }

    /// Creates the account if missing, leaving an existing one alone.
    pub fn ensure_user(&self, name: &str, password: &str, is_admin: bool) -> Result<(User, bool)> {
        Ok(user::insert_new_user(
            &*self.store,
            &self.secret_hash_key,
            NewUser {
                name,
                password,
                is_admin,
            },
        )?)
    }

    pub fn password_matches(&self, name: &str, password: &str) -> Result<bool> {
        Ok(
            user::check_matching_password(&*self.store, &self.secret_hash_key, name, password)?
                .unwrap_or(false),
        )
    }
}

/// The declared owner of a resource. Absent resources are NotFound, which is
/// not the same as an existing resource without an owner.
pub fn resolve_owner(server: &Server, kind: Kind, id: Uuid) -> Result<Option<Uuid>> {
    Ok(server.get(kind, id)?.owner)
}

pub fn authorize(identity: &Identity, owner: Option<Uuid>, operation: Operation) -> Result<()> {
    if identity.is_admin {
        return Ok(());
    }
    match owner {
        None => Ok(()),
        Some(owner) if owner == identity.id => Ok(()),
        Some(_) => Err(Error::NotAuthorized(format!(
            "{} may not {:?} a resource it doesn't own",
            identity.name, operation
        ))),
    }
}

/// Resolves the owner of a resource and authorizes the operation on it,
/// returning the resource as it was when checked.
pub fn authorize_resource(
    server: &Server,
    identity: &Identity,
    kind: Kind,
    id: Uuid,
    operation: Operation,
) -> Result<Record> {
    let record = server.get(kind, id)?;
    authorize(identity, record.owner, operation)?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn auth() -> Auth {
        Auth::new(Arc::new(MemoryStore::new()), b"test-secret")
    }

    fn password(name: &str, password: &str) -> Credentials {
        Credentials::Password {
            name: name.into(),
            password: password.into(),
        }
    }

    #[test]
    fn parses_basic_and_bearer_headers() {
        let header = format!("Basic {}", STANDARD.encode("alice:pw:with:colons"));
        assert_eq!(
            Credentials::from_authorization(&header).unwrap(),
            password("alice", "pw:with:colons")
        );

        let header = format!("Basic {}", STANDARD.encode("abc123:"));
        assert_eq!(
            Credentials::from_authorization(&header).unwrap(),
            Credentials::Token("abc123".into())
        );
        assert_eq!(
            Credentials::from_authorization("Bearer abc123").unwrap(),
            Credentials::Token("abc123".into())
        );
    }

    #[test]
    fn garbage_headers_are_malformed_not_rejected() {
        for header in &["Basic", "Basic !!!", "Digest abc", "Bearer  "] {
            assert!(
                matches!(
                    Credentials::from_authorization(header),
                    Err(Error::MalformedInput(_))
                ),
                "{}",
                header
            );
        }
        let no_colon = format!("Basic {}", STANDARD.encode("alice"));
        assert!(matches!(
            Credentials::from_authorization(&no_colon),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn unknown_user_is_signed_up_once() {
        let auth = auth();
        let first = auth.verify(&password("alice", "pw")).unwrap();
        let second = auth.verify(&password("alice", "pw")).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_admin);
        assert_eq!(auth.store.ids("users").unwrap().len(), 1);
    }

    #[test]
    fn concurrent_first_logins_share_one_account() {
        let auth = auth();
        let logins: Vec<_> = (0..4)
            .map(|_| {
                let auth = auth.clone();
                std::thread::spawn(move || auth.verify(&password("alice", "pw")).unwrap())
            })
            .collect();
        let ids: Vec<Uuid> = logins
            .into_iter()
            .map(|login| login.join().unwrap().id)
            .collect();

        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(auth.store.ids("users").unwrap().len(), 1);
    }

    #[test]
    fn wrong_password_is_rejected_without_side_effects() {
        let auth = auth();
        auth.verify(&password("alice", "pw")).unwrap();
        assert!(matches!(
            auth.verify(&password("alice", "nope")),
            Err(Error::AuthenticationRejected)
        ));
        assert_eq!(auth.store.ids("users").unwrap().len(), 1);
    }

    #[test]
    fn odd_usernames_are_not_signed_up() {
        let auth = auth();
        assert!(matches!(
            auth.verify(&password("bad name", "pw")),
            Err(Error::AuthenticationRejected)
        ));
        assert!(auth.store.ids("users").unwrap().is_empty());
    }

    #[test]
    fn tokens_authenticate_until_regenerated() {
        let auth = auth();
        let alice = auth.verify(&password("alice", "pw")).unwrap();
        let token = auth.token(&alice).unwrap();
        assert_eq!(auth.verify(&Credentials::Token(token.clone())).unwrap(), alice);

        let fresh = auth.regenerate_token(&alice).unwrap();
        assert!(matches!(
            auth.verify(&Credentials::Token(token)),
            Err(Error::AuthenticationRejected)
        ));
        assert_eq!(auth.verify(&Credentials::Token(fresh)).unwrap(), alice);
        assert!(matches!(
            auth.verify(&Credentials::Token("never-issued".into())),
            Err(Error::AuthenticationRejected)
        ));
    }

    #[test]
    fn gate_allows_owner_admin_and_unowned() {
        let alice = User {
            id: Uuid::new_v4(),
            name: "alice".into(),
            is_admin: false,
        };
        let admin = User {
            id: Uuid::new_v4(),
            name: "admin".into(),
            is_admin: true,
        };
        let bob = Uuid::new_v4();

        assert!(authorize(&alice, Some(alice.id), Operation::Delete).is_ok());
        assert!(authorize(&alice, None, Operation::Get).is_ok());
        assert!(authorize(&admin, Some(bob), Operation::Update).is_ok());
        assert!(matches!(
            authorize(&alice, Some(bob), Operation::Get),
            Err(Error::NotAuthorized(_))
        ));
    }

    #[test]
    fn owner_is_resolved_from_the_stored_record() {
        use crate::models::file::FileStorage;
        use serde_json::json;

        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(
            Arc::new(MemoryStore::new()),
            FileStorage::new(dir.path()).unwrap(),
        );
        let alice = Uuid::new_v4();
        let fields = json!({ "name": "hw" }).as_object().cloned().unwrap();
        let assignment = server.create(Kind::Assignment, alice, fields, None).unwrap();

        assert_eq!(
            resolve_owner(&server, Kind::Assignment, assignment.id).unwrap(),
            Some(alice)
        );
        assert!(matches!(
            resolve_owner(&server, Kind::Assignment, Uuid::new_v4()),
            Err(Error::NotFound(_))
        ));
    }
}
