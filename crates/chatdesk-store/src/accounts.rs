use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use chatdesk_core::ids::AccountId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountRole {
    Customer,
    Agent,
    Admin,
}

impl AccountRole {
    /// Agents and admins may answer chats across all sessions.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Self::Agent | Self::Admin)
    }
}

impl std::fmt::Display for AccountRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Customer => write!(f, "customer"),
            Self::Agent => write!(f, "agent"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for AccountRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(Self::Customer),
            "agent" => Ok(Self::Agent),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown account role: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub email: String,
    pub role: AccountRole,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AccountRepo {
    db: Database,
}

impl AccountRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(role = %role))]
    pub fn create(&self, name: &str, email: &str, role: AccountRole) -> Result<Account, StoreError> {
        let id = AccountId::new();
        let created_at = row_helpers::now();

        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO accounts (id, name, email, role, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    id.as_str(),
                    name,
                    email,
                    role.to_string(),
                    row_helpers::format_timestamp(&created_at),
                ],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Conflict(format!("email already registered: {email}")))
                }
                Err(e) => Err(e.into()),
            }
        })?;

        Ok(Account {
            id,
            name: name.to_string(),
            email: email.to_string(),
            role,
            created_at,
        })
    }

    #[instrument(skip(self), fields(account_id = %id))]
    pub fn get(&self, id: &AccountId) -> Result<Account, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, email, role, created_at FROM accounts WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_account(row),
                None => Err(StoreError::NotFound(format!("account {id}"))),
            }
        })
    }

    #[instrument(skip(self))]
    pub fn find_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, email, role, created_at FROM accounts WHERE email = ?1",
            )?;
            let mut rows = stmt.query([email])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_account(row)?)),
                None => Ok(None),
            }
        })
    }
}

fn row_to_account(row: &rusqlite::Row<'_>) -> Result<Account, StoreError> {
    let role: String = row_helpers::get(row, 3, "accounts", "role")?;
    let created_at: String = row_helpers::get(row, 4, "accounts", "created_at")?;

    Ok(Account {
        id: AccountId::from_raw(row_helpers::get::<String>(row, 0, "accounts", "id")?),
        name: row_helpers::get(row, 1, "accounts", "name")?,
        email: row_helpers::get(row, 2, "accounts", "email")?,
        role: row_helpers::parse_enum(&role, "accounts", "role")?,
        created_at: row_helpers::parse_timestamp(&created_at, "accounts", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> AccountRepo {
        AccountRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_and_get() {
        let repo = repo();
        let account = repo.create("Sam Ortiz", "sam@shop.test", AccountRole::Agent).unwrap();
        assert!(account.id.as_str().starts_with("acct_"));

        let fetched = repo.get(&account.id).unwrap();
        assert_eq!(fetched, account);
    }

    #[test]
    fn get_missing_is_not_found() {
        let result = repo().get(&AccountId::from_raw("acct_missing"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn duplicate_email_conflicts() {
        let repo = repo();
        repo.create("A", "dup@shop.test", AccountRole::Customer).unwrap();
        let second = repo.create("B", "dup@shop.test", AccountRole::Customer);
        assert!(matches!(second, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn find_by_email() {
        let repo = repo();
        let account = repo.create("Lee", "lee@shop.test", AccountRole::Admin).unwrap();
        assert_eq!(repo.find_by_email("lee@shop.test").unwrap().unwrap().id, account.id);
        assert!(repo.find_by_email("nobody@shop.test").unwrap().is_none());
    }

    #[test]
    fn privileged_roles() {
        assert!(AccountRole::Agent.is_privileged());
        assert!(AccountRole::Admin.is_privileged());
        assert!(!AccountRole::Customer.is_privileged());
        assert_eq!("admin".parse::<AccountRole>().unwrap(), AccountRole::Admin);
    }
}
