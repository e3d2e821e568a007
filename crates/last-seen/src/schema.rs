pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE last_seen (
  ip              TEXT PRIMARY KEY,
  port            INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
  seen_at         INTEGER NOT NULL
);

CREATE INDEX idx_last_seen_seen_at ON last_seen(seen_at);

COMMIT;
"#;
