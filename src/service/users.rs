//! User accounts, profiles and friendships
//!
//! Reads go through the coalescing cache (`user:{id}`); profile writes go to
//! the relational store first and then invalidate the cached snapshot.

use crate::cache::{CacheStore, CoalescingCache, EntityLoader};
use crate::common::{Error, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
    Argon2,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

pub type UserId = u64;

/// Cache namespace for user snapshots
pub const USER_CACHE_NAMESPACE: &str = "user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    #[default]
    Unknown,
    Male,
    Female,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    #[default]
    Active,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub nickname: String,
    pub email: String,
    /// Never serialized, so never cached or returned
    #[serde(skip)]
    pub password_hash: String,
    pub age: u32,
    pub gender: Gender,
    pub avatar: String,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: UserId, name: impl Into<String>, email: impl Into<String>) -> Self {
        let now = Utc::now();
        let name = name.into();
        Self {
            id,
            nickname: name.clone(),
            name,
            email: email.into(),
            password_hash: String::new(),
            age: 0,
            gender: Gender::Unknown,
            avatar: String::new(),
            status: UserStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Sign-up payload for `POST /api/v1/users`
#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub name: String,
    #[serde(default)]
    pub nickname: String,
    pub email: String,
    pub password: String,
}

impl Registration {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidRequest("name is required".into()));
        }
        if !self.email.contains('@') {
            return Err(Error::InvalidRequest(format!("invalid email {:?}", self.email)));
        }
        if self.password.is_empty() {
            return Err(Error::InvalidRequest("password is required".into()));
        }
        Ok(())
    }
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Internal(format!("password hashing failed: {}", e)))
}

/// Partial profile update; absent fields are left alone
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileUpdate {
    pub nickname: Option<String>,
    pub age: Option<u32>,
    pub gender: Option<Gender>,
    pub avatar: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.nickname.is_none() && self.age.is_none() && self.gender.is_none() && self.avatar.is_none()
    }
}

/// Relational store contract for users and friendships
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, id: UserId) -> Result<Option<User>>;

    /// Reserve a fresh user id
    async fn next_id(&self) -> Result<UserId>;

    /// Insert a new row; `Conflict` if the id or email is taken
    async fn insert(&self, user: User) -> Result<()>;

    /// Apply `update` and return the stored row
    async fn update_profile(&self, id: UserId, update: &ProfileUpdate) -> Result<User>;

    async fn add_friend(&self, user: UserId, friend: UserId) -> Result<()>;

    async fn list_friends(&self, user: UserId) -> Result<Vec<UserId>>;
}

#[derive(Default)]
struct Tables {
    users: HashMap<UserId, User>,
    emails: HashMap<String, UserId>,
    last_id: UserId,
    friends: HashMap<UserId, BTreeSet<UserId>>,
}

/// In-memory user table
#[derive(Default)]
pub struct MemoryUserStore {
    tables: RwLock<Tables>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.read().users.get(&id).cloned())
    }

    async fn next_id(&self) -> Result<UserId> {
        let mut tables = self.write();
        tables.last_id += 1;
        Ok(tables.last_id)
    }

    async fn insert(&self, user: User) -> Result<()> {
        let mut tables = self.write();
        if tables.users.contains_key(&user.id) {
            return Err(Error::Conflict(format!("user {} already exists", user.id)));
        }
        let email = user.email.to_lowercase();
        if tables.emails.contains_key(&email) {
            return Err(Error::Conflict(format!("email {} is already registered", user.email)));
        }
        tables.last_id = tables.last_id.max(user.id);
        tables.emails.insert(email, user.id);
        tables.users.insert(user.id, user);
        Ok(())
    }

    async fn update_profile(&self, id: UserId, update: &ProfileUpdate) -> Result<User> {
        let mut tables = self.write();
        let user = tables
            .users
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("user {}", id)))?;
        if let Some(nickname) = &update.nickname {
            user.nickname = nickname.clone();
        }
        if let Some(age) = update.age {
            user.age = age;
        }
        if let Some(gender) = update.gender {
            user.gender = gender;
        }
        if let Some(avatar) = &update.avatar {
            user.avatar = avatar.clone();
        }
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn add_friend(&self, user: UserId, friend: UserId) -> Result<()> {
        let mut tables = self.write();
        for id in [user, friend] {
            if !tables.users.contains_key(&id) {
                return Err(Error::NotFound(format!("user {}", id)));
            }
        }
        tables.friends.entry(user).or_default().insert(friend);
        tables.friends.entry(friend).or_default().insert(user);
        Ok(())
    }

    async fn list_friends(&self, user: UserId) -> Result<Vec<UserId>> {
        let tables = self.read();
        if !tables.users.contains_key(&user) {
            return Err(Error::NotFound(format!("user {}", user)));
        }
        Ok(tables
            .friends
            .get(&user)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }
}

/// Loads users for the cache by their string id
struct UserLoader {
    store: Arc<dyn UserStore>,
}

#[async_trait]
impl EntityLoader<User> for UserLoader {
    async fn load(&self, id: &str) -> Result<Option<User>> {
        let id: UserId = id
            .parse()
            .map_err(|_| Error::InvalidRequest(format!("invalid user id {:?}", id)))?;
        self.store.get(id).await
    }
}

pub struct UserService {
    store: Arc<dyn UserStore>,
    cache: CoalescingCache<User>,
}

impl UserService {
    pub fn new(
        store: Arc<dyn UserStore>,
        cache_store: Arc<dyn CacheStore>,
        ttl: Duration,
        shards: usize,
    ) -> Self {
        let loader = Arc::new(UserLoader {
            store: store.clone(),
        });
        Self {
            store,
            cache: CoalescingCache::new(USER_CACHE_NAMESPACE, cache_store, loader, ttl, shards),
        }
    }

    pub fn cache(&self) -> &CoalescingCache<User> {
        &self.cache
    }

    pub async fn get_user(&self, id: UserId) -> Result<User> {
        self.cache
            .read(&id.to_string())
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {}", id)))
    }

    pub async fn create_user(&self, user: User) -> Result<()> {
        let id = user.id;
        self.cache
            .write_then_invalidate(&id.to_string(), self.store.insert(user))
            .await
    }

    /// Sign up: allocate an id, store an active user with a hashed password
    pub async fn register(&self, registration: Registration) -> Result<User> {
        registration.validate()?;
        let id = self.store.next_id().await?;

        let mut user = User::new(id, registration.name.trim(), registration.email.trim());
        if !registration.nickname.trim().is_empty() {
            user.nickname = registration.nickname.trim().to_string();
        }
        user.password_hash = hash_password(&registration.password)?;

        self.create_user(user.clone()).await?;
        tracing::info!(user = id, "User registered");
        Ok(user)
    }

    pub async fn update_profile(&self, id: UserId, update: ProfileUpdate) -> Result<User> {
        if update.is_empty() {
            return Err(Error::InvalidRequest("empty profile update".into()));
        }
        let store = self.store.clone();
        self.cache
            .write_then_invalidate(&id.to_string(), async move {
                store.update_profile(id, &update).await
            })
            .await
    }

    pub async fn add_friend(&self, user: UserId, friend: UserId) -> Result<()> {
        if user == friend {
            return Err(Error::InvalidRequest("cannot befriend yourself".into()));
        }
        self.store.add_friend(user, friend).await
    }

    pub async fn list_friends(&self, user: UserId) -> Result<Vec<UserId>> {
        self.store.list_friends(user).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;

    fn service() -> (UserService, Arc<MemoryUserStore>) {
        let store = Arc::new(MemoryUserStore::new());
        let svc = UserService::new(
            store.clone(),
            Arc::new(MemoryCacheStore::new()),
            Duration::from_secs(900),
            16,
        );
        (svc, store)
    }

    #[test]
    fn test_password_hash_not_serialized() {
        let mut user = User::new(1, "ada", "ada@example.com");
        user.password_hash = "argon2id$secret".into();
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("password"));
        assert!(!json.contains("secret"));
    }

    #[tokio::test]
    async fn test_update_profile_visible_to_next_read() {
        let (svc, _) = service();
        svc.create_user(User::new(7, "ada", "ada@example.com")).await.unwrap();

        assert_eq!(svc.get_user(7).await.unwrap().nickname, "ada");
        let update = ProfileUpdate {
            nickname: Some("countess".into()),
            ..Default::default()
        };
        svc.update_profile(7, update).await.unwrap();
        assert_eq!(svc.get_user(7).await.unwrap().nickname, "countess");
    }

    fn registration(name: &str, email: &str) -> Registration {
        Registration {
            name: name.into(),
            nickname: String::new(),
            email: email.into(),
            password: "correct horse".into(),
        }
    }

    #[tokio::test]
    async fn test_register_allocates_ids_and_rejects_duplicate_email() {
        let (svc, store) = service();
        let ada = svc.register(registration("ada", "ada@example.com")).await.unwrap();
        let bob = svc.register(registration("bob", "bob@example.com")).await.unwrap();
        assert_ne!(ada.id, bob.id);
        assert_eq!(ada.status, UserStatus::Active);
        assert_eq!(ada.nickname, "ada");

        let stored = store.get(ada.id).await.unwrap().unwrap();
        assert!(stored.password_hash.starts_with("$argon2"));
        assert!(!stored.password_hash.contains("correct horse"));
        assert_eq!(svc.get_user(bob.id).await.unwrap().email, "bob@example.com");

        let err = svc
            .register(registration("ada2", "ADA@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let err = svc.register(registration("", "x@example.com")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_register_after_explicit_ids() {
        let (svc, _) = service();
        svc.create_user(User::new(41, "a", "a@x")).await.unwrap();
        let next = svc.register(registration("b", "b@x")).await.unwrap();
        assert_eq!(next.id, 42);
        assert!(matches!(
            svc.create_user(User::new(41, "c", "c@x")).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_user() {
        let (svc, _) = service();
        assert!(matches!(svc.get_user(404).await, Err(Error::NotFound(_))));
        let update = ProfileUpdate {
            age: Some(30),
            ..Default::default()
        };
        assert!(matches!(svc.update_profile(404, update).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_friendships() {
        let (svc, _) = service();
        svc.create_user(User::new(1, "a", "a@x")).await.unwrap();
        svc.create_user(User::new(2, "b", "b@x")).await.unwrap();

        assert!(matches!(svc.add_friend(1, 1).await, Err(Error::InvalidRequest(_))));
        svc.add_friend(1, 2).await.unwrap();
        assert_eq!(svc.list_friends(1).await.unwrap(), vec![2]);
        assert_eq!(svc.list_friends(2).await.unwrap(), vec![1]);
        assert!(matches!(svc.add_friend(1, 3).await, Err(Error::NotFound(_))));
    }
}
