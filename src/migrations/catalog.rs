//! Known migrations: the embedded catalog plus loading from a directory.
//!
//! Each migration is a forward/backward DDL pair identified by a
//! zero-padded integer prefix, `NNN_name.up.sql` / `NNN_name.down.sql`.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::{MemoryError, Result};

/// One versioned forward/backward DDL pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: u32,
    pub name: String,
    pub up: Cow<'static, str>,
    pub down: Cow<'static, str>,
}

/// Schema objects a migration is allowed to touch, lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnedObjects {
    pub tables: BTreeSet<String>,
    pub indexes: BTreeSet<String>,
}

impl OwnedObjects {
    pub fn owns(&self, object_name: &str, table_name: &str) -> bool {
        self.tables.contains(&table_name.to_ascii_lowercase())
            || self.indexes.contains(&object_name.to_ascii_lowercase())
    }
}

macro_rules! embedded {
    ($version:literal, $name:literal) => {
        Migration {
            version: $version,
            name: $name.to_owned(),
            up: Cow::Borrowed(include_str!(concat!(
                "../../migrations/",
                stringify!($version),
                "_",
                $name,
                ".up.sql"
            ))),
            down: Cow::Borrowed(include_str!(concat!(
                "../../migrations/",
                stringify!($version),
                "_",
                $name,
                ".down.sql"
            ))),
        }
    };
}

/// Migrations compiled into the crate, ascending.
pub fn builtin_migrations() -> Vec<Migration> {
    vec![
        embedded!(001, "create_facts"),
        embedded!(002, "create_episodes"),
        embedded!(003, "create_affinity"),
    ]
}

impl Migration {
    /// `NNN_name` as it appears in file names.
    pub fn id(&self) -> String {
        format!("{:03}_{}", self.version, self.name)
    }

    pub fn up_statements(&self) -> Vec<String> {
        split_statements(&self.up)
    }

    pub fn down_statements(&self) -> Vec<String> {
        split_statements(&self.down)
    }

    /// Tables and indexes named by either script.
    pub fn owned_objects(&self) -> OwnedObjects {
        let mut owned = OwnedObjects::default();
        for stmt in self.up_statements().iter().chain(&self.down_statements()) {
            collect_owned(stmt, &mut owned);
        }
        owned
    }

    /// Load every `NNN_name.up.sql` / `NNN_name.down.sql` pair in `dir`.
    ///
    /// Other files are ignored. A missing half, a duplicate version or a
    /// malformed prefix is a [`MemoryError::Migration`].
    pub fn load_dir(dir: &Path) -> Result<Vec<Migration>> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            MemoryError::Migration(format!("cannot read {}: {e}", dir.display()))
        })?;

        let mut halves: BTreeMap<u32, (String, Option<String>, Option<String>)> = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| MemoryError::Migration(e.to_string()))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some((stem, is_up)) = split_direction(&file_name) else {
                continue;
            };
            let (version, name) = parse_stem(stem)?;
            let sql = std::fs::read_to_string(entry.path()).map_err(|e| {
                MemoryError::Migration(format!("cannot read {file_name}: {e}"))
            })?;

            let slot = halves
                .entry(version)
                .or_insert_with(|| (name.to_owned(), None, None));
            if slot.0 != name {
                return Err(MemoryError::Migration(format!(
                    "duplicate migration version {version}: `{}` and `{name}`",
                    slot.0
                )));
            }
            let half = if is_up { &mut slot.1 } else { &mut slot.2 };
            if half.replace(sql).is_some() {
                return Err(MemoryError::Migration(format!(
                    "duplicate file for migration {version:03}_{name}"
                )));
            }
        }

        halves
            .into_iter()
            .map(|(version, (name, up, down))| match (up, down) {
                (Some(up), Some(down)) => Ok(Migration {
                    version,
                    name,
                    up: Cow::Owned(up),
                    down: Cow::Owned(down),
                }),
                (None, _) => Err(MemoryError::Migration(format!(
                    "migration {version:03}_{name} has no .up.sql"
                ))),
                (_, None) => Err(MemoryError::Migration(format!(
                    "migration {version:03}_{name} has no .down.sql"
                ))),
            })
            .collect()
    }
}

/// Versions must be positive, unique and ascending.
pub(crate) fn validate_catalog(migrations: &[Migration]) -> Result<()> {
    let mut previous = 0;
    for m in migrations {
        if m.version <= previous {
            return Err(MemoryError::Migration(format!(
                "migration {} is out of order or duplicated (after version {previous})",
                m.id()
            )));
        }
        previous = m.version;
    }
    Ok(())
}

fn split_direction(file_name: &str) -> Option<(&str, bool)> {
    if let Some(stem) = file_name.strip_suffix(".up.sql") {
        Some((stem, true))
    } else {
        file_name.strip_suffix(".down.sql").map(|stem| (stem, false))
    }
}

fn parse_stem(stem: &str) -> Result<(u32, &str)> {
    let malformed = || {
        MemoryError::Migration(format!(
            "migration file `{stem}` must be named NNN_name with a numeric prefix"
        ))
    };
    let (prefix, name) = stem.split_once('_').ok_or_else(malformed)?;
    if prefix.is_empty() || name.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let version: u32 = prefix.parse().map_err(|_| malformed())?;
    if version == 0 {
        return Err(malformed());
    }
    Ok((version, name))
}

/// Split a script into statements on `;`, ignoring `--` comments and
/// semicolons inside quoted literals.
pub(crate) fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    current.push(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    for skipped in chars.by_ref() {
                        if skipped == '\n' {
                            current.push('\n');
                            break;
                        }
                    }
                }
                ';' => push_statement(&mut statements, &mut current),
                _ => current.push(c),
            },
        }
    }
    push_statement(&mut statements, &mut current);
    statements
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let normalized = current.split_whitespace().collect::<Vec<_>>().join(" ");
    if !normalized.is_empty() {
        statements.push(normalized);
    }
    current.clear();
}

fn unquote(name: &str) -> String {
    let bare = name
        .trim_matches(|c| matches!(c, '"' | '`' | '[' | ']'))
        .to_ascii_lowercase();
    match bare.split_once('.') {
        Some(("main" | "temp", rest)) => rest.trim_matches('"').to_owned(),
        _ => bare,
    }
}

fn collect_owned(statement: &str, owned: &mut OwnedObjects) {
    let tokens: Vec<String> = statement
        .split(|c: char| c.is_whitespace() || c == '(' || c == ')' || c == ',')
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect();
    let upper: Vec<String> = tokens.iter().map(|t| t.to_ascii_uppercase()).collect();
    let at = |i: usize| upper.get(i).map(String::as_str);

    // Skip `IF [NOT] EXISTS` starting at i.
    let skip_if = |mut i: usize| {
        if at(i) == Some("IF") {
            i += 1;
            if at(i) == Some("NOT") {
                i += 1;
            }
            i += 1;
        }
        i
    };

    let mut i = 0;
    let verb = at(i);
    i += 1;
    match verb {
        Some("CREATE") => {
            if matches!(at(i), Some("TEMP" | "TEMPORARY")) {
                i += 1;
            }
            if at(i) == Some("UNIQUE") {
                i += 1;
            }
            match at(i) {
                Some("TABLE") => {
                    if let Some(name) = tokens.get(skip_if(i + 1)) {
                        owned.tables.insert(unquote(name));
                    }
                }
                Some("INDEX") => {
                    if let Some(name) = tokens.get(skip_if(i + 1)) {
                        owned.indexes.insert(unquote(name));
                    }
                }
                _ => {}
            }
        }
        Some("ALTER") if at(i) == Some("TABLE") => {
            if let Some(name) = tokens.get(i + 1) {
                owned.tables.insert(unquote(name));
            }
            // RENAME TO moves ownership to the new name as well.
            if let Some(pos) = upper.iter().position(|t| t == "TO")
                && let Some(new_name) = tokens.get(pos + 1)
            {
                owned.tables.insert(unquote(new_name));
            }
        }
        Some("DROP") => match at(i) {
            Some("TABLE") => {
                if let Some(name) = tokens.get(skip_if(i + 1)) {
                    owned.tables.insert(unquote(name));
                }
            }
            Some("INDEX") => {
                if let Some(name) = tokens.get(skip_if(i + 1)) {
                    owned.indexes.insert(unquote(name));
                }
            }
            _ => {}
        },
        _ => {}
    }
}
