/// Schema for the query and resource cache tables.
pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Offline-aware query cache (one serialized JSON value per key)
CREATE TABLE IF NOT EXISTS query_cache (
    query_hash TEXT PRIMARY KEY,
    query_description TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL
);

-- Resource cache generations (one per deployed version tag)
CREATE TABLE IF NOT EXISTS cache_generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Captured responses, partitioned by generation
CREATE TABLE IF NOT EXISTS resource_cache (
    generation TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (generation, cache_key),
    FOREIGN KEY (generation) REFERENCES cache_generations(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_resource_cache_generation ON resource_cache(generation);
"#;
