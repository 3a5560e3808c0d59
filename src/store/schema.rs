/// Database schema. Executed on initialization; statements are idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    normalized_name TEXT NOT NULL UNIQUE,
    email TEXT,
    password_hash TEXT,
    email_verified INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    is_org INTEGER NOT NULL DEFAULT 0,
    private_quota_bytes INTEGER,
    public_quota_bytes INTEGER,
    private_used_bytes INTEGER NOT NULL DEFAULT 0,
    public_used_bytes INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_organizations (
    user INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    organization INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (user, organization)
);

CREATE TABLE IF NOT EXISTS repositories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_type TEXT NOT NULL,
    namespace TEXT NOT NULL,
    name TEXT NOT NULL,
    full_id TEXT NOT NULL,
    private INTEGER NOT NULL DEFAULT 0,
    owner INTEGER NOT NULL REFERENCES users(id),
    quota_bytes INTEGER,
    used_bytes INTEGER NOT NULL DEFAULT 0,
    lfs_threshold_bytes INTEGER,
    lfs_suffix_patterns TEXT,
    lfs_keep_versions INTEGER,
    created_at TEXT NOT NULL,
    UNIQUE (repo_type, namespace, name)
);
CREATE INDEX IF NOT EXISTS idx_repositories_namespace ON repositories(namespace);
CREATE INDEX IF NOT EXISTS idx_repositories_full_id ON repositories(full_id);

CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    path_in_repo TEXT NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    sha256 TEXT NOT NULL,
    lfs INTEGER NOT NULL DEFAULT 0,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    owner INTEGER NOT NULL REFERENCES users(id),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (repository, path_in_repo)
);
CREATE INDEX IF NOT EXISTS idx_files_sha256 ON files(sha256);

CREATE TABLE IF NOT EXISTS commits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    commit_id TEXT NOT NULL,
    repository INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    repo_type TEXT NOT NULL,
    branch TEXT NOT NULL,
    author INTEGER NOT NULL REFERENCES users(id),
    username TEXT NOT NULL,
    message TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_commits_repository ON commits(repository, commit_id);

CREATE TABLE IF NOT EXISTS lfs_object_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    -- History must outlive the file row: syncs after reset/revert hard-delete
    -- dropped paths, and the oid log is the GC source of truth.
    file INTEGER REFERENCES files(id) ON DELETE SET NULL,
    path_in_repo TEXT NOT NULL,
    sha256 TEXT NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    commit_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_lfs_history_path ON lfs_object_history(repository, path_in_repo);
CREATE INDEX IF NOT EXISTS idx_lfs_history_sha256 ON lfs_object_history(sha256);
CREATE INDEX IF NOT EXISTS idx_lfs_history_commit ON lfs_object_history(repository, commit_id);

CREATE TABLE IF NOT EXISTS staging_uploads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    repo_type TEXT NOT NULL,
    revision TEXT NOT NULL,
    path_in_repo TEXT NOT NULL,
    sha256 TEXT NOT NULL DEFAULT '',
    size INTEGER NOT NULL DEFAULT 0,
    upload_id TEXT,
    storage_key TEXT NOT NULL,
    lfs INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    token_hash TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_used TEXT
);
"#;
