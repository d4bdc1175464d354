//! In-memory document store.
//!
//! All six collections live behind one lock so that a snapshot is always
//! taken at a single instant. Mutations are synchronous closures: a handler
//! finishes its change before it can reach an await point, and no other
//! handler ever observes a half-updated record.

mod models;

pub use models::*;

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("An account with email {0} already exists")]
    DuplicateEmail(String),

    #[error("Record {0} not found")]
    NotFound(String),

    #[error("Record is missing an \"id\" field")]
    MissingId,
}

/// Collections owned by the record-manager handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Subjects,
    Rooms,
    Schedule,
    FixedSchedules,
}

#[derive(Debug, Default)]
pub struct DocumentStore {
    inner: RwLock<Snapshot>,
    revision: AtomicU64,
}

impl DocumentStore {
    pub fn new(mut snapshot: Snapshot) -> Self {
        for user in &mut snapshot.users {
            user.normalize();
        }
        Self {
            inner: RwLock::new(snapshot),
            revision: AtomicU64::new(0),
        }
    }

    /// Copy of every collection as it is right now
    pub fn snapshot(&self) -> Snapshot {
        self.inner.read().clone()
    }

    /// Number of mutations applied since the store was opened
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn read<R>(&self, f: impl FnOnce(&Snapshot) -> R) -> R {
        f(&self.inner.read())
    }

    /// Apply a mutation to the whole document
    pub fn write<R>(&self, f: impl FnOnce(&mut Snapshot) -> R) -> R {
        let mut guard = self.inner.write();
        let result = f(&mut guard);
        self.revision.fetch_add(1, Ordering::AcqRel);
        result
    }

    // -------------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------------

    pub fn user(&self, id: &str) -> Option<User> {
        self.read(|s| s.users.iter().find(|u| u.id == id).cloned())
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        let email = email.trim();
        self.read(|s| {
            s.users
                .iter()
                .find(|u| u.email.eq_ignore_ascii_case(email))
                .cloned()
        })
    }

    pub fn users_with_status(&self, status: Option<UserStatus>) -> Vec<User> {
        self.read(|s| {
            s.users
                .iter()
                .filter(|u| status.map_or(true, |st| u.status == st))
                .cloned()
                .collect()
        })
    }

    /// Append a user, enforcing case-insensitive email uniqueness under the
    /// same lock as the insert
    pub fn insert_user(&self, user: User) -> Result<(), StoreError> {
        let mut guard = self.inner.write();
        if guard
            .users
            .iter()
            .any(|u| u.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(StoreError::DuplicateEmail(user.email));
        }
        guard.users.push(user);
        self.revision.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Mutate one user in place. Returns `None` if the id is unknown. The
    /// revision only moves when the closure actually changed the record.
    pub fn update_user<R>(&self, id: &str, f: impl FnOnce(&mut User) -> R) -> Option<R> {
        let mut guard = self.inner.write();
        let user = guard.users.iter_mut().find(|u| u.id == id)?;
        Some(self.apply(user, f))
    }

    pub fn update_user_by_email<R>(&self, email: &str, f: impl FnOnce(&mut User) -> R) -> Option<R> {
        let email = email.trim();
        let mut guard = self.inner.write();
        let user = guard
            .users
            .iter_mut()
            .find(|u| u.email.eq_ignore_ascii_case(email))?;
        Some(self.apply(user, f))
    }

    fn apply<R>(&self, user: &mut User, f: impl FnOnce(&mut User) -> R) -> R {
        let before = user.clone();
        let result = f(user);
        if *user != before {
            self.revision.fetch_add(1, Ordering::AcqRel);
        }
        result
    }

    /// Remove a user if `pred` accepts it. `Ok(None)` means the user exists
    /// but was kept.
    pub fn remove_user_if(
        &self,
        id: &str,
        pred: impl FnOnce(&User) -> bool,
    ) -> Result<Option<User>, StoreError> {
        let mut guard = self.inner.write();
        let idx = guard
            .users
            .iter()
            .position(|u| u.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !pred(&guard.users[idx]) {
            return Ok(None);
        }
        let removed = guard.users.remove(idx);
        self.revision.fetch_add(1, Ordering::AcqRel);
        Ok(Some(removed))
    }

    // -------------------------------------------------------------------------
    // Departments
    // -------------------------------------------------------------------------

    pub fn department(&self, id: &str) -> Option<Department> {
        self.read(|s| s.departments.iter().find(|d| d.id == id).cloned())
    }

    pub fn insert_department(&self, department: Department) {
        self.write(|s| s.departments.push(department));
    }

    // -------------------------------------------------------------------------
    // Record-manager collections
    // -------------------------------------------------------------------------

    fn records_mut(snapshot: &mut Snapshot, collection: Collection) -> &mut Vec<serde_json::Value> {
        match collection {
            Collection::Subjects => &mut snapshot.subjects,
            Collection::Rooms => &mut snapshot.rooms,
            Collection::Schedule => &mut snapshot.schedule,
            Collection::FixedSchedules => &mut snapshot.fixed_schedules,
        }
    }

    pub fn records(&self, collection: Collection) -> Vec<serde_json::Value> {
        self.read(|s| match collection {
            Collection::Subjects => s.subjects.clone(),
            Collection::Rooms => s.rooms.clone(),
            Collection::Schedule => s.schedule.clone(),
            Collection::FixedSchedules => s.fixed_schedules.clone(),
        })
    }

    pub fn append_record(&self, collection: Collection, record: serde_json::Value) -> Result<(), StoreError> {
        if record_id(&record).is_none() {
            return Err(StoreError::MissingId);
        }
        self.write(|s| Self::records_mut(s, collection).push(record));
        Ok(())
    }

    /// Replace the record with the same id
    pub fn replace_record(&self, collection: Collection, record: serde_json::Value) -> Result<(), StoreError> {
        let id = record_id(&record).ok_or(StoreError::MissingId)?;
        let mut guard = self.inner.write();
        let slot = Self::records_mut(&mut guard, collection)
            .iter_mut()
            .find(|r| record_id(r).as_deref() == Some(id.as_str()))
            .ok_or(StoreError::NotFound(id))?;
        *slot = record;
        self.revision.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn remove_record(&self, collection: Collection, id: &str) -> Result<serde_json::Value, StoreError> {
        let mut guard = self.inner.write();
        let records = Self::records_mut(&mut guard, collection);
        let idx = records
            .iter()
            .position(|r| record_id(r).as_deref() == Some(id))
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let removed = records.remove(idx);
        self.revision.fetch_add(1, Ordering::AcqRel);
        Ok(removed)
    }
}

/// Ids in the record collections are strings or numbers depending on which
/// manager created them
fn record_id(record: &serde_json::Value) -> Option<String> {
    match record.get("id")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_email_uniqueness_is_case_insensitive() {
        let store = DocumentStore::default();
        store.insert_user(User::new("a@x.com", "A", "One")).unwrap();

        let err = store.insert_user(User::new("A@X.COM", "A", "Two")).unwrap_err();
        assert_eq!(err, StoreError::DuplicateEmail("a@x.com".to_string()));
        assert_eq!(store.snapshot().users.len(), 1);
        assert!(store.user_by_email(" A@x.Com ").is_some());
    }

    #[test]
    fn test_update_user_bumps_revision() {
        let store = DocumentStore::default();
        let user = User::new("a@x.com", "A", "One");
        let id = user.id.clone();
        store.insert_user(user).unwrap();
        let before = store.revision();

        let status = store.update_user(&id, |u| {
            u.status = UserStatus::Approved;
            u.status
        });
        assert_eq!(status, Some(UserStatus::Approved));
        assert!(store.revision() > before);
        assert_eq!(store.user(&id).unwrap().status, UserStatus::Approved);

        assert!(store.update_user("missing", |_| ()).is_none());
    }

    #[test]
    fn test_rejected_update_keeps_revision() {
        let store = DocumentStore::default();
        store.insert_user(User::new("a@x.com", "A", "One")).unwrap();
        let before = store.revision();

        let outcome: Option<Result<(), &str>> = store.update_user_by_email("a@x.com", |u| {
            if u.status == UserStatus::Pending {
                return Err("still pending");
            }
            u.role = Role::Admin;
            Ok(())
        });
        assert_eq!(outcome, Some(Err("still pending")));
        assert_eq!(store.revision(), before);

        store.update_user_by_email("A@x.com", |u| u.role = Role::Faculty);
        assert_eq!(store.revision(), before + 1);
    }

    #[test]
    fn test_remove_user_if() {
        let store = DocumentStore::default();
        let user = User::new("a@x.com", "A", "One");
        let id = user.id.clone();
        store.insert_user(user).unwrap();

        assert_eq!(store.remove_user_if(&id, |_| false).unwrap().map(|u| u.id), None);
        assert!(store.user(&id).is_some());

        let removed = store.remove_user_if(&id, |u| u.status == UserStatus::Pending).unwrap();
        assert_eq!(removed.unwrap().id, id);
        assert!(store.user(&id).is_none());

        assert!(matches!(store.remove_user_if(&id, |_| true), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_new_normalizes_loaded_users() {
        let mut legacy = User::new("Legacy@X.com", "L", "Egacy");
        legacy.verified = false;
        legacy.email_verified = true;
        legacy.email = "Legacy@X.com".to_string();

        let store = DocumentStore::new(Snapshot {
            users: vec![legacy],
            ..Snapshot::default()
        });
        let user = store.user_by_email("legacy@x.com").unwrap();
        assert!(user.is_verified());
        assert_eq!(user.email, "legacy@x.com");
    }

    #[test]
    fn test_record_collections() {
        let store = DocumentStore::default();
        store.append_record(Collection::Rooms, json!({"id": 7, "name": "Lab 1"})).unwrap();
        store.append_record(Collection::Rooms, json!({"id": "r2", "name": "Lab 2"})).unwrap();
        assert_eq!(
            store.append_record(Collection::Rooms, json!({"name": "no id"})),
            Err(StoreError::MissingId)
        );

        store.replace_record(Collection::Rooms, json!({"id": 7, "name": "Lab 1A"})).unwrap();
        let rooms = store.records(Collection::Rooms);
        assert_eq!(rooms[0]["name"], "Lab 1A");

        let removed = store.remove_record(Collection::Rooms, "r2").unwrap();
        assert_eq!(removed["name"], "Lab 2");
        assert_eq!(store.records(Collection::Rooms).len(), 1);
        assert!(store.records(Collection::Subjects).is_empty());
        assert!(matches!(
            store.remove_record(Collection::Rooms, "r2"),
            Err(StoreError::NotFound(_))
        ));
    }
}
