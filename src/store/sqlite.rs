use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::schema::SCHEMA;
use super::{FileUpsert, NewCommit, NewLfsHistory, NewUser, Store};
use crate::error::{Error, Result};
use crate::rules::normalize_name;
use crate::types::*;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn now() -> String {
    format_datetime(&Utc::now())
}

/// "?1, ?2, ..." for dynamic IN clauses.
fn placeholders(from: usize, count: usize) -> String {
    (from..from + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

const USER_COLUMNS: &str = "id, username, normalized_name, email, password_hash, \
     email_verified, is_active, is_org, private_quota_bytes, public_quota_bytes, \
     private_used_bytes, public_used_bytes, created_at";

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        normalized_name: row.get(2)?,
        email: row.get(3)?,
        password_hash: row.get(4)?,
        email_verified: row.get(5)?,
        is_active: row.get(6)?,
        is_org: row.get(7)?,
        private_quota_bytes: row.get(8)?,
        public_quota_bytes: row.get(9)?,
        private_used_bytes: row.get(10)?,
        public_used_bytes: row.get(11)?,
        created_at: parse_datetime(&row.get::<_, String>(12)?),
    })
}

const REPO_COLUMNS: &str = "id, repo_type, namespace, name, full_id, private, owner, \
     quota_bytes, used_bytes, lfs_threshold_bytes, lfs_suffix_patterns, \
     lfs_keep_versions, created_at";

fn row_to_repository(row: &Row) -> rusqlite::Result<Repository> {
    let repo_type: String = row.get(1)?;
    Ok(Repository {
        id: row.get(0)?,
        repo_type: RepoType::from_str(&repo_type).unwrap_or(RepoType::Model),
        namespace: row.get(2)?,
        name: row.get(3)?,
        full_id: row.get(4)?,
        private: row.get(5)?,
        owner: row.get(6)?,
        quota_bytes: row.get(7)?,
        used_bytes: row.get(8)?,
        lfs_threshold_bytes: row.get(9)?,
        lfs_suffix_patterns: row.get(10)?,
        lfs_keep_versions: row.get(11)?,
        created_at: parse_datetime(&row.get::<_, String>(12)?),
    })
}

const FILE_COLUMNS: &str =
    "id, repository, path_in_repo, size, sha256, lfs, is_deleted, owner, created_at, updated_at";

fn row_to_file(row: &Row) -> rusqlite::Result<File> {
    Ok(File {
        id: row.get(0)?,
        repository: row.get(1)?,
        path_in_repo: row.get(2)?,
        size: row.get(3)?,
        sha256: row.get(4)?,
        lfs: row.get(5)?,
        is_deleted: row.get(6)?,
        owner: row.get(7)?,
        created_at: parse_datetime(&row.get::<_, String>(8)?),
        updated_at: parse_datetime(&row.get::<_, String>(9)?),
    })
}

const COMMIT_COLUMNS: &str = "id, commit_id, repository, repo_type, branch, author, \
     username, message, description, created_at";

fn row_to_commit(row: &Row) -> rusqlite::Result<Commit> {
    let repo_type: String = row.get(3)?;
    Ok(Commit {
        id: row.get(0)?,
        commit_id: row.get(1)?,
        repository: row.get(2)?,
        repo_type: RepoType::from_str(&repo_type).unwrap_or(RepoType::Model),
        branch: row.get(4)?,
        author: row.get(5)?,
        username: row.get(6)?,
        message: row.get(7)?,
        description: row.get(8)?,
        created_at: parse_datetime(&row.get::<_, String>(9)?),
    })
}

const LFS_HISTORY_COLUMNS: &str =
    "id, repository, file, path_in_repo, sha256, size, commit_id, created_at";

fn row_to_lfs_history(row: &Row) -> rusqlite::Result<LfsObjectHistory> {
    Ok(LfsObjectHistory {
        id: row.get(0)?,
        repository: row.get(1)?,
        file: row.get(2)?,
        path_in_repo: row.get(3)?,
        sha256: row.get(4)?,
        size: row.get(5)?,
        commit_id: row.get(6)?,
        created_at: parse_datetime(&row.get::<_, String>(7)?),
    })
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    // User / organization operations

    fn create_user(&self, new: &NewUser) -> Result<User> {
        let conn = self.conn();
        let normalized = normalize_name(new.username);
        conn.execute(
            "INSERT INTO users (username, normalized_name, email, password_hash, is_org, \
             private_quota_bytes, public_quota_bytes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.username,
                normalized,
                new.email,
                new.password_hash,
                new.is_org,
                new.private_quota_bytes,
                new.public_quota_bytes,
                now(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![id],
            row_to_user,
        )
        .map_err(Error::from)
    }

    fn get_user_by_id(&self, id: i64) -> Result<Option<User>> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                row_to_user,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                params![username],
                row_to_user,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_organization(&self, name: &str) -> Result<Option<User>> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1 AND is_org = 1"),
                params![name],
                row_to_user,
            )
            .optional()
            .map_err(Error::from)
    }

    fn normalized_name_exists(&self, normalized: &str) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM users WHERE normalized_name = ?1",
            params![normalized],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn set_user_usage(&self, user_id: i64, private_used: i64, public_used: i64) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE users SET private_used_bytes = ?1, public_used_bytes = ?2 WHERE id = ?3",
            params![private_used, public_used, user_id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn add_user_usage(&self, user_id: i64, delta: i64, private: bool) -> Result<()> {
        let column = if private {
            "private_used_bytes"
        } else {
            "public_used_bytes"
        };
        let rows = self.conn().execute(
            &format!("UPDATE users SET {column} = MAX(0, {column} + ?1) WHERE id = ?2"),
            params![delta, user_id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    // Membership operations

    fn get_membership(&self, user_id: i64, org_id: i64) -> Result<Option<UserOrganization>> {
        self.conn()
            .query_row(
                "SELECT user, organization, role, created_at FROM user_organizations
                 WHERE user = ?1 AND organization = ?2",
                params![user_id, org_id],
                |row| {
                    let role: String = row.get(2)?;
                    Ok(UserOrganization {
                        user: row.get(0)?,
                        organization: row.get(1)?,
                        role: OrgRole::from_str(&role).unwrap_or(OrgRole::Visitor),
                        created_at: parse_datetime(&row.get::<_, String>(3)?),
                    })
                },
            )
            .optional()
            .map_err(Error::from)
    }

    fn create_membership(&self, user_id: i64, org_id: i64, role: OrgRole) -> Result<()> {
        self.conn().execute(
            "INSERT INTO user_organizations (user, organization, role, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user, organization) DO UPDATE SET role = excluded.role",
            params![user_id, org_id, role.as_str(), now()],
        )?;
        Ok(())
    }

    fn list_user_organizations(&self, user_id: i64) -> Result<Vec<User>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM users u
             JOIN user_organizations uo ON uo.organization = u.id
             WHERE uo.user = ?1 ORDER BY u.username",
            USER_COLUMNS
                .split(", ")
                .map(|c| format!("u.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))?;
        let rows = stmt.query_map(params![user_id], row_to_user)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Repository operations

    fn create_repository(
        &self,
        repo_type: RepoType,
        namespace: &str,
        name: &str,
        private: bool,
        owner: i64,
    ) -> Result<Repository> {
        let conn = self.conn();
        let full_id = format!("{namespace}/{name}");
        conn.execute(
            "INSERT INTO repositories (repo_type, namespace, name, full_id, private, owner, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                repo_type.as_str(),
                namespace,
                name,
                full_id,
                private,
                owner,
                now(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {REPO_COLUMNS} FROM repositories WHERE id = ?1"),
            params![id],
            row_to_repository,
        )
        .map_err(Error::from)
    }

    fn get_repository(
        &self,
        repo_type: RepoType,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Repository>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {REPO_COLUMNS} FROM repositories
                     WHERE repo_type = ?1 AND namespace = ?2 AND name = ?3"
                ),
                params![repo_type.as_str(), namespace, name],
                row_to_repository,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_repositories(
        &self,
        repo_type: Option<RepoType>,
        author: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Repository>> {
        let conn = self.conn();
        let mut sql = format!("SELECT {REPO_COLUMNS} FROM repositories WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(t) = repo_type {
            args.push(Box::new(t.as_str().to_string()));
            sql.push_str(&format!(" AND repo_type = ?{}", args.len()));
        }
        if let Some(ns) = author {
            args.push(Box::new(ns.to_string()));
            sql.push_str(&format!(" AND namespace = ?{}", args.len()));
        }
        args.push(Box::new(limit));
        sql.push_str(&format!(" ORDER BY created_at DESC LIMIT ?{}", args.len()));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            row_to_repository,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_namespace_repositories(&self, namespace: &str) -> Result<Vec<Repository>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REPO_COLUMNS} FROM repositories WHERE namespace = ?1 ORDER BY name"
        ))?;
        let rows = stmt.query_map(params![namespace], row_to_repository)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn update_repository_identity(
        &self,
        id: i64,
        namespace: &str,
        name: &str,
        quota_bytes: Option<i64>,
    ) -> Result<()> {
        let full_id = format!("{namespace}/{name}");
        let rows = self.conn().execute(
            "UPDATE repositories SET namespace = ?1, name = ?2, full_id = ?3, quota_bytes = ?4
             WHERE id = ?5",
            params![namespace, name, full_id, quota_bytes, id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn update_repository_used_bytes(&self, id: i64, used_bytes: i64) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE repositories SET used_bytes = ?1 WHERE id = ?2",
            params![used_bytes, id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn sum_namespace_used_bytes(&self, namespace: &str, private: bool) -> Result<i64> {
        self.conn()
            .query_row(
                "SELECT COALESCE(SUM(used_bytes), 0) FROM repositories
                 WHERE namespace = ?1 AND private = ?2",
                params![namespace, private],
                |row| row.get(0),
            )
            .map_err(Error::from)
    }

    fn delete_repository(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM repositories WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // File operations

    fn get_file(&self, repository: i64, path: &str) -> Result<Option<File>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {FILE_COLUMNS} FROM files WHERE repository = ?1 AND path_in_repo = ?2"
                ),
                params![repository, path],
                row_to_file,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_file_by_sha256(&self, sha256: &str) -> Result<Option<File>> {
        self.conn()
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE sha256 = ?1 LIMIT 1"),
                params![sha256],
                row_to_file,
            )
            .optional()
            .map_err(Error::from)
    }

    fn count_active_lfs_files(&self, sha256: &str, repository: Option<i64>) -> Result<i64> {
        let conn = self.conn();
        match repository {
            Some(repo) => conn.query_row(
                "SELECT COUNT(*) FROM files
                 WHERE sha256 = ?1 AND lfs = 1 AND is_deleted = 0 AND repository = ?2",
                params![sha256, repo],
                |row| row.get(0),
            ),
            None => conn.query_row(
                "SELECT COUNT(*) FROM files WHERE sha256 = ?1 AND lfs = 1 AND is_deleted = 0",
                params![sha256],
                |row| row.get(0),
            ),
        }
        .map_err(Error::from)
    }

    fn upsert_file(&self, upsert: &FileUpsert) -> Result<File> {
        let conn = self.conn();
        let ts = now();
        conn.execute(
            "INSERT INTO files (repository, path_in_repo, size, sha256, lfs, is_deleted, owner, \
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?7)
             ON CONFLICT (repository, path_in_repo) DO UPDATE SET
                 size = excluded.size,
                 sha256 = excluded.sha256,
                 lfs = excluded.lfs,
                 is_deleted = 0,
                 updated_at = excluded.updated_at",
            params![
                upsert.repository,
                upsert.path_in_repo,
                upsert.size,
                upsert.sha256,
                upsert.lfs,
                upsert.owner,
                ts,
            ],
        )?;
        conn.query_row(
            &format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE repository = ?1 AND path_in_repo = ?2"
            ),
            params![upsert.repository, upsert.path_in_repo],
            row_to_file,
        )
        .map_err(Error::from)
    }

    fn mark_file_deleted(&self, repository: i64, path: &str) -> Result<usize> {
        let rows = self.conn().execute(
            "UPDATE files SET is_deleted = 1, updated_at = ?1
             WHERE repository = ?2 AND path_in_repo = ?3",
            params![now(), repository, path],
        )?;
        Ok(rows)
    }

    fn mark_folder_deleted(&self, repository: i64, prefix: &str) -> Result<usize> {
        // ESCAPE so user paths containing % or _ stay literal.
        let pattern = format!(
            "{}%",
            prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        let rows = self.conn().execute(
            "UPDATE files SET is_deleted = 1, updated_at = ?1
             WHERE repository = ?2 AND path_in_repo LIKE ?3 ESCAPE '\\'",
            params![now(), repository, pattern],
        )?;
        Ok(rows)
    }

    fn delete_files_in(&self, repository: i64, paths: &[String]) -> Result<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM files WHERE repository = ?1 AND path_in_repo IN ({})",
            placeholders(2, paths.len())
        );
        let mut args: Vec<&dyn rusqlite::types::ToSql> = vec![&repository];
        for p in paths {
            args.push(p);
        }
        let rows = self.conn().execute(&sql, args.as_slice())?;
        Ok(rows)
    }

    fn delete_files_not_in(&self, repository: i64, paths: &[String]) -> Result<usize> {
        if paths.is_empty() {
            let rows = self
                .conn()
                .execute("DELETE FROM files WHERE repository = ?1", params![repository])?;
            return Ok(rows);
        }
        let sql = format!(
            "DELETE FROM files WHERE repository = ?1 AND path_in_repo NOT IN ({})",
            placeholders(2, paths.len())
        );
        let mut args: Vec<&dyn rusqlite::types::ToSql> = vec![&repository];
        for p in paths {
            args.push(p);
        }
        let rows = self.conn().execute(&sql, args.as_slice())?;
        Ok(rows)
    }

    fn list_active_files(&self, repository: i64) -> Result<Vec<File>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE repository = ?1 AND is_deleted = 0 ORDER BY path_in_repo"
        ))?;
        let rows = stmt.query_map(params![repository], row_to_file)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_files_by_paths(&self, repository: i64, paths: &[String]) -> Result<Vec<File>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE repository = ?1 AND path_in_repo IN ({})",
            placeholders(2, paths.len())
        );
        let mut args: Vec<&dyn rusqlite::types::ToSql> = vec![&repository];
        for p in paths {
            args.push(p);
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args.as_slice(), row_to_file)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn sum_active_file_bytes(&self, repository: i64) -> Result<i64> {
        self.conn()
            .query_row(
                "SELECT COALESCE(SUM(size), 0) FROM files
                 WHERE repository = ?1 AND is_deleted = 0",
                params![repository],
                |row| row.get(0),
            )
            .map_err(Error::from)
    }

    // Commit operations

    fn create_commit_record(&self, new: &NewCommit) -> Result<Commit> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO commits (commit_id, repository, repo_type, branch, author, username, \
             message, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                new.commit_id,
                new.repository,
                new.repo_type.as_str(),
                new.branch,
                new.author,
                new.username,
                new.message,
                new.description,
                now(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {COMMIT_COLUMNS} FROM commits WHERE id = ?1"),
            params![id],
            row_to_commit,
        )
        .map_err(Error::from)
    }

    fn get_commit_record(&self, repository: i64, commit_id: &str) -> Result<Option<Commit>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {COMMIT_COLUMNS} FROM commits
                     WHERE repository = ?1 AND commit_id = ?2"
                ),
                params![repository, commit_id],
                row_to_commit,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_commit_records(
        &self,
        repository: i64,
        commit_ids: &[String],
    ) -> Result<Vec<Commit>> {
        if commit_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let sql = format!(
            "SELECT {COMMIT_COLUMNS} FROM commits
             WHERE repository = ?1 AND commit_id IN ({})",
            placeholders(2, commit_ids.len())
        );
        let mut args: Vec<&dyn rusqlite::types::ToSql> = vec![&repository];
        for c in commit_ids {
            args.push(c);
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args.as_slice(), row_to_commit)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // LFS history operations

    fn insert_lfs_history(&self, new: &NewLfsHistory) -> Result<LfsObjectHistory> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO lfs_object_history (repository, file, path_in_repo, sha256, size, \
             commit_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                new.repository,
                new.file,
                new.path_in_repo,
                new.sha256,
                new.size,
                new.commit_id,
                now(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {LFS_HISTORY_COLUMNS} FROM lfs_object_history WHERE id = ?1"),
            params![id],
            row_to_lfs_history,
        )
        .map_err(Error::from)
    }

    fn list_lfs_history_for_path(
        &self,
        repository: i64,
        path: &str,
    ) -> Result<Vec<LfsObjectHistory>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LFS_HISTORY_COLUMNS} FROM lfs_object_history
             WHERE repository = ?1 AND path_in_repo = ?2
             ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map(params![repository, path], row_to_lfs_history)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_lfs_history_for_commit(
        &self,
        repository: i64,
        commit_id: &str,
    ) -> Result<Vec<LfsObjectHistory>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LFS_HISTORY_COLUMNS} FROM lfs_object_history
             WHERE repository = ?1 AND commit_id = ?2"
        ))?;
        let rows = stmt.query_map(params![repository, commit_id], row_to_lfs_history)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn distinct_lfs_sha256(&self, repository: i64) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT sha256 FROM lfs_object_history WHERE repository = ?1",
        )?;
        let rows = stmt.query_map(params![repository], |row| row.get::<_, String>(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn count_lfs_history(&self, sha256: &str, repository: Option<i64>) -> Result<i64> {
        let conn = self.conn();
        match repository {
            Some(repo) => conn.query_row(
                "SELECT COUNT(*) FROM lfs_object_history WHERE sha256 = ?1 AND repository = ?2",
                params![sha256, repo],
                |row| row.get(0),
            ),
            None => conn.query_row(
                "SELECT COUNT(*) FROM lfs_object_history WHERE sha256 = ?1",
                params![sha256],
                |row| row.get(0),
            ),
        }
        .map_err(Error::from)
    }

    fn delete_lfs_history_by_sha256(
        &self,
        sha256: &str,
        repository: Option<i64>,
    ) -> Result<usize> {
        let conn = self.conn();
        let rows = match repository {
            Some(repo) => conn.execute(
                "DELETE FROM lfs_object_history WHERE sha256 = ?1 AND repository = ?2",
                params![sha256, repo],
            )?,
            None => conn.execute(
                "DELETE FROM lfs_object_history WHERE sha256 = ?1",
                params![sha256],
            )?,
        };
        Ok(rows)
    }

    // Staging upload operations

    #[allow(clippy::too_many_arguments)]
    fn create_staging_upload(
        &self,
        repository: i64,
        repo_type: RepoType,
        revision: &str,
        path_in_repo: &str,
        sha256: &str,
        size: i64,
        storage_key: &str,
        lfs: bool,
    ) -> Result<StagingUpload> {
        let conn = self.conn();
        let ts = now();
        conn.execute(
            "INSERT INTO staging_uploads (repository, repo_type, revision, path_in_repo, \
             sha256, size, storage_key, lfs, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                repository,
                repo_type.as_str(),
                revision,
                path_in_repo,
                sha256,
                size,
                storage_key,
                lfs,
                ts,
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            "SELECT id, repository, repo_type, revision, path_in_repo, sha256, size, \
             upload_id, storage_key, lfs, created_at
             FROM staging_uploads WHERE id = ?1",
            params![id],
            |row| {
                let repo_type: String = row.get(2)?;
                Ok(StagingUpload {
                    id: row.get(0)?,
                    repository: row.get(1)?,
                    repo_type: RepoType::from_str(&repo_type).unwrap_or(RepoType::Model),
                    revision: row.get(3)?,
                    path_in_repo: row.get(4)?,
                    sha256: row.get(5)?,
                    size: row.get(6)?,
                    upload_id: row.get(7)?,
                    storage_key: row.get(8)?,
                    lfs: row.get(9)?,
                    created_at: parse_datetime(&row.get::<_, String>(10)?),
                })
            },
        )
        .map_err(Error::from)
    }

    fn delete_staging_uploads(&self, repository: i64) -> Result<usize> {
        let rows = self.conn().execute(
            "DELETE FROM staging_uploads WHERE repository = ?1",
            params![repository],
        )?;
        Ok(rows)
    }

    // Token operations

    fn create_token(&self, user_id: i64, token_hash: &str, name: &str) -> Result<Token> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tokens (user, token_hash, name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, token_hash, name, now()],
        )?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            "SELECT id, user, token_hash, name, created_at, last_used FROM tokens WHERE id = ?1",
            params![id],
            |row| {
                Ok(Token {
                    id: row.get(0)?,
                    user: row.get(1)?,
                    token_hash: row.get(2)?,
                    name: row.get(3)?,
                    created_at: parse_datetime(&row.get::<_, String>(4)?),
                    last_used: row
                        .get::<_, Option<String>>(5)?
                        .map(|s| parse_datetime(&s)),
                })
            },
        )
        .map_err(Error::from)
    }

    fn get_token_by_hash(&self, token_hash: &str) -> Result<Option<Token>> {
        self.conn()
            .query_row(
                "SELECT id, user, token_hash, name, created_at, last_used
                 FROM tokens WHERE token_hash = ?1",
                params![token_hash],
                |row| {
                    Ok(Token {
                        id: row.get(0)?,
                        user: row.get(1)?,
                        token_hash: row.get(2)?,
                        name: row.get(3)?,
                        created_at: parse_datetime(&row.get::<_, String>(4)?),
                        last_used: row
                            .get::<_, Option<String>>(5)?
                            .map(|s| parse_datetime(&s)),
                    })
                },
            )
            .optional()
            .map_err(Error::from)
    }

    fn touch_token(&self, id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE tokens SET last_used = ?1 WHERE id = ?2",
            params![now(), id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileUpsert, NewCommit, NewLfsHistory, NewUser};

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        store
    }

    fn user(store: &SqliteStore, name: &str, is_org: bool) -> User {
        store
            .create_user(&NewUser {
                username: name,
                email: None,
                password_hash: None,
                is_org,
                private_quota_bytes: None,
                public_quota_bytes: None,
            })
            .unwrap()
    }

    fn repo(store: &SqliteStore, owner: &User, name: &str) -> Repository {
        store
            .create_repository(RepoType::Model, &owner.username, name, false, owner.id)
            .unwrap()
    }

    #[test]
    fn user_uniqueness_is_normalized() {
        let store = store();
        user(&store, "My-Name", false);
        assert!(store.normalized_name_exists("myname").unwrap());
        assert!(!store.normalized_name_exists("other").unwrap());
        // "my_name" normalizes to the same value and must collide.
        assert!(
            store
                .create_user(&NewUser {
                    username: "my_name",
                    email: None,
                    password_hash: None,
                    is_org: false,
                    private_quota_bytes: None,
                    public_quota_bytes: None,
                })
                .is_err()
        );
    }

    #[test]
    fn repository_unique_per_type() {
        let store = store();
        let alice = user(&store, "alice", false);
        repo(&store, &alice, "m1");
        assert!(
            store
                .create_repository(RepoType::Model, "alice", "m1", false, alice.id)
                .is_err()
        );
        // Same name, different type is fine.
        store
            .create_repository(RepoType::Dataset, "alice", "m1", false, alice.id)
            .unwrap();
    }

    #[test]
    fn upsert_file_updates_and_resurrects() {
        let store = store();
        let alice = user(&store, "alice", false);
        let r = repo(&store, &alice, "m1");

        let f = store
            .upsert_file(&FileUpsert {
                repository: r.id,
                path_in_repo: "a.txt",
                size: 5,
                sha256: "aaaa",
                lfs: false,
                owner: alice.id,
            })
            .unwrap();
        assert!(!f.is_deleted);

        store.mark_file_deleted(r.id, "a.txt").unwrap();
        let f = store.get_file(r.id, "a.txt").unwrap().unwrap();
        assert!(f.is_deleted);

        let f = store
            .upsert_file(&FileUpsert {
                repository: r.id,
                path_in_repo: "a.txt",
                size: 6,
                sha256: "bbbb",
                lfs: true,
                owner: alice.id,
            })
            .unwrap();
        assert!(!f.is_deleted);
        assert_eq!(f.sha256, "bbbb");
        assert!(f.lfs);
        // Row id preserved across the rewrite.
        assert_eq!(
            store.get_file(r.id, "a.txt").unwrap().unwrap().id,
            f.id
        );
    }

    #[test]
    fn folder_tombstone_respects_prefix() {
        let store = store();
        let alice = user(&store, "alice", false);
        let r = repo(&store, &alice, "m1");
        for path in ["dir/a.txt", "dir/b.txt", "dir2/c.txt"] {
            store
                .upsert_file(&FileUpsert {
                    repository: r.id,
                    path_in_repo: path,
                    size: 1,
                    sha256: "x",
                    lfs: false,
                    owner: alice.id,
                })
                .unwrap();
        }
        let updated = store.mark_folder_deleted(r.id, "dir/").unwrap();
        assert_eq!(updated, 2);
        assert_eq!(store.list_active_files(r.id).unwrap().len(), 1);
    }

    #[test]
    fn cascade_delete_clears_dependents() {
        let store = store();
        let alice = user(&store, "alice", false);
        let r = repo(&store, &alice, "m1");
        let f = store
            .upsert_file(&FileUpsert {
                repository: r.id,
                path_in_repo: "w.bin",
                size: 10,
                sha256: "cafe",
                lfs: true,
                owner: alice.id,
            })
            .unwrap();
        store
            .insert_lfs_history(&NewLfsHistory {
                repository: r.id,
                file: Some(f.id),
                path_in_repo: "w.bin",
                sha256: "cafe",
                size: 10,
                commit_id: "c1",
            })
            .unwrap();
        store
            .create_commit_record(&NewCommit {
                commit_id: "c1",
                repository: r.id,
                repo_type: RepoType::Model,
                branch: "main",
                author: alice.id,
                username: "alice",
                message: "init",
                description: "",
            })
            .unwrap();

        assert!(store.delete_repository(r.id).unwrap());
        assert!(store.get_file(r.id, "w.bin").unwrap().is_none());
        assert_eq!(store.count_lfs_history("cafe", None).unwrap(), 0);
        assert!(store.get_commit_record(r.id, "c1").unwrap().is_none());
    }

    #[test]
    fn hard_delete_keeps_history_with_nulled_file_pointer() {
        let store = store();
        let alice = user(&store, "alice", false);
        let r = repo(&store, &alice, "m1");

        for path in ["keep.bin", "dropped.bin"] {
            let f = store
                .upsert_file(&FileUpsert {
                    repository: r.id,
                    path_in_repo: path,
                    size: 10,
                    sha256: "cafe",
                    lfs: true,
                    owner: alice.id,
                })
                .unwrap();
            store
                .insert_lfs_history(&NewLfsHistory {
                    repository: r.id,
                    file: Some(f.id),
                    path_in_repo: path,
                    sha256: "cafe",
                    size: 10,
                    commit_id: "c1",
                })
                .unwrap();
        }

        // Sync after a reset removes paths not in the new tree; the history
        // rows they anchor must survive.
        let removed = store
            .delete_files_not_in(r.id, &["keep.bin".to_string()])
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_file(r.id, "dropped.bin").unwrap().is_none());

        let history = store
            .list_lfs_history_for_path(r.id, "dropped.bin")
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].file, None);

        // The revert/merge path hard-deletes by explicit path list.
        let removed = store
            .delete_files_in(r.id, &["keep.bin".to_string()])
            .unwrap();
        assert_eq!(removed, 1);
        let history = store.list_lfs_history_for_path(r.id, "keep.bin").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].file, None);
    }

    #[test]
    fn usage_accounting() {
        let store = store();
        let alice = user(&store, "alice", false);
        store.add_user_usage(alice.id, 100, false).unwrap();
        store.add_user_usage(alice.id, -40, false).unwrap();
        let alice = store.get_user_by_id(alice.id).unwrap().unwrap();
        assert_eq!(alice.public_used_bytes, 60);
        // Never goes negative.
        store.add_user_usage(alice.id, -1000, false).unwrap();
        let alice = store.get_user_by_id(alice.id).unwrap().unwrap();
        assert_eq!(alice.public_used_bytes, 0);
    }

    #[test]
    fn lfs_history_ordering_newest_first() {
        let store = store();
        let alice = user(&store, "alice", false);
        let r = repo(&store, &alice, "m1");
        for (oid, commit) in [("o1", "c1"), ("o2", "c2"), ("o1", "c3")] {
            store
                .insert_lfs_history(&NewLfsHistory {
                    repository: r.id,
                    file: None,
                    path_in_repo: "w.bin",
                    sha256: oid,
                    size: 1,
                    commit_id: commit,
                })
                .unwrap();
        }
        let history = store.list_lfs_history_for_path(r.id, "w.bin").unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].commit_id, "c3");
        assert_eq!(history[2].commit_id, "c1");
    }
}
