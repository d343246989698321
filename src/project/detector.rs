//! Project kind and feature detection.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use walkdir::WalkDir;

use super::{Feature, ProjectKind};
use crate::env::ProjectEnv;

/// Python dependency manifests, searched for package names.
const PYTHON_MANIFESTS: &[&str] = &["pyproject.toml", "requirements.txt", "Pipfile", "setup.py"];

/// How deep to look for a Django `settings.py`.
const SETTINGS_MAX_DEPTH: usize = 3;

/// Project kind and feature detector.
pub struct ProjectDetector<'a> {
    path: &'a Path,
}

impl<'a> ProjectDetector<'a> {
    /// Create a new project detector.
    pub fn new(path: &'a Path) -> Self {
        Self { path }
    }

    /// Detect the project kind.
    pub fn detect_kind(&self) -> ProjectKind {
        // Composer is authoritative: Laravel projects often ship Python tooling too
        if self.exists("composer.json") {
            return ProjectKind::Php;
        }

        if self.is_php() {
            return ProjectKind::Php;
        }

        if self.is_python() {
            return ProjectKind::Python;
        }

        ProjectKind::Unknown
    }

    /// Detect feature flags for a project of the given kind.
    pub fn detect_features(&self, kind: ProjectKind) -> BTreeSet<Feature> {
        let mut features = BTreeSet::new();
        let env = ProjectEnv::load(self.path);

        let sqlite_only = detect_from_env(&env, &mut features);

        match kind {
            ProjectKind::Php => self.detect_php(&mut features, sqlite_only),
            ProjectKind::Python => self.detect_python(&mut features, sqlite_only),
            ProjectKind::Unknown => {}
        }

        if features.contains(&Feature::DbMysql) || features.contains(&Feature::DbPostgres) {
            features.insert(Feature::HasDatabase);
        }

        features
    }

    fn detect_php(&self, features: &mut BTreeSet<Feature>, sqlite_only: bool) {
        if self.exists("artisan") {
            features.insert(Feature::Laravel);
        }
        if self.exists("symfony.lock") || self.exists("bin/console") {
            features.insert(Feature::Symfony);
        }
        if self.exists("config/database.php") && !sqlite_only {
            features.insert(Feature::HasDatabase);
        }

        let Some(composer) = self.read_json("composer.json") else {
            return;
        };

        let packages: Vec<&str> = ["require", "require-dev"]
            .iter()
            .filter_map(|section| composer.get(section).and_then(|v| v.as_object()))
            .flat_map(|deps| deps.keys().map(String::as_str))
            .collect();

        for package in packages {
            match package {
                "laravel/framework" => {
                    features.insert(Feature::Laravel);
                }
                p if p.starts_with("symfony/framework-bundle") => {
                    features.insert(Feature::Symfony);
                }
                p if p.starts_with("doctrine/orm") || p.starts_with("doctrine/dbal") => {
                    if !sqlite_only {
                        features.insert(Feature::HasDatabase);
                    }
                }
                "predis/predis" | "ext-redis" | "snc/redis-bundle" => {
                    features.insert(Feature::HasRedis);
                }
                "symfony/mailer" | "phpmailer/phpmailer" => {
                    features.insert(Feature::HasMail);
                }
                _ => {}
            }
        }
    }

    fn detect_python(&self, features: &mut BTreeSet<Feature>, sqlite_only: bool) {
        if self.exists("manage.py") {
            features.insert(Feature::Django);
        }

        let manifests: String = PYTHON_MANIFESTS
            .iter()
            .filter_map(|name| fs::read_to_string(self.path.join(name)).ok())
            .collect::<Vec<_>>()
            .join("\n")
            .to_lowercase();

        if contains_package(&manifests, "django") {
            features.insert(Feature::Django);
        }
        if contains_package(&manifests, "flask") {
            features.insert(Feature::Flask);
        }
        if contains_package(&manifests, "psycopg") || contains_package(&manifests, "asyncpg") {
            insert_driver(features, Feature::DbPostgres);
        }
        if contains_package(&manifests, "mysqlclient") || contains_package(&manifests, "pymysql") {
            insert_driver(features, Feature::DbMysql);
        }
        if contains_package(&manifests, "sqlalchemy") && !sqlite_only {
            features.insert(Feature::HasDatabase);
        }
        if contains_package(&manifests, "redis") || contains_package(&manifests, "celery") {
            features.insert(Feature::HasRedis);
        }

        if let Some(settings) = self.find_django_settings(ProjectKind::Python) {
            if settings.contains("django.db.backends.postgresql") {
                insert_driver(features, Feature::DbPostgres);
            } else if settings.contains("django.db.backends.mysql") {
                insert_driver(features, Feature::DbMysql);
            }
            if settings.contains("django_redis") || settings.contains("RedisCache") {
                features.insert(Feature::HasRedis);
            }
            if settings.contains("EMAIL_HOST") {
                features.insert(Feature::HasMail);
            }
        }
    }

    fn find_django_settings(&self, kind: ProjectKind) -> Option<String> {
        let ignore = kind.ignore_dirs();
        WalkDir::new(self.path)
            .max_depth(SETTINGS_MAX_DEPTH)
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !e.file_type().is_dir()
                    || !ignore.iter().any(|d| e.file_name() == *d)
            })
            .filter_map(Result::ok)
            .find(|e| e.file_type().is_file() && e.file_name() == "settings.py")
            .and_then(|e| fs::read_to_string(e.path()).ok())
    }

    fn is_php(&self) -> bool {
        self.exists("artisan") || self.exists("index.php") || self.exists("public/index.php")
    }

    fn is_python(&self) -> bool {
        PYTHON_MANIFESTS.iter().any(|m| self.exists(m)) || self.exists("manage.py")
    }

    fn exists(&self, relative: &str) -> bool {
        self.path.join(relative).exists()
    }

    fn read_json(&self, relative: &str) -> Option<serde_json::Value> {
        let content = fs::read_to_string(self.path.join(relative)).ok()?;
        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(file = relative, error = %e, "Ignoring unparsable manifest");
                None
            }
        }
    }
}

/// Apply `.env` hints. Returns true when the project is configured for SQLite
/// only, which needs no database service.
fn detect_from_env(env: &ProjectEnv, features: &mut BTreeSet<Feature>) -> bool {
    let mut sqlite_only = false;

    if let Some(connection) = env.get("DB_CONNECTION") {
        match connection.to_lowercase().as_str() {
            "mysql" | "mariadb" => insert_driver(features, Feature::DbMysql),
            "pgsql" | "postgres" | "postgresql" => insert_driver(features, Feature::DbPostgres),
            "sqlite" => sqlite_only = true,
            _ => {
                features.insert(Feature::HasDatabase);
            }
        }
    }

    if let Some(url) = env.get("DATABASE_URL") {
        let url = url.to_lowercase();
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            insert_driver(features, Feature::DbPostgres);
        } else if url.starts_with("mysql://") || url.starts_with("mariadb://") {
            insert_driver(features, Feature::DbMysql);
        } else if url.starts_with("sqlite:") {
            sqlite_only = true;
        }
    }

    if env.contains("DB_HOST") && !sqlite_only {
        features.insert(Feature::HasDatabase);
    }

    let redis_driver = ["CACHE_DRIVER", "CACHE_STORE", "SESSION_DRIVER", "QUEUE_CONNECTION"]
        .iter()
        .any(|key| env.get(key).is_some_and(|v| v.eq_ignore_ascii_case("redis")));
    if env.contains("REDIS_HOST") || env.contains("REDIS_URL") || redis_driver {
        features.insert(Feature::HasRedis);
    }

    let smtp = env.get("MAIL_MAILER").is_some_and(|v| v.eq_ignore_ascii_case("smtp"));
    if smtp || env.contains("MAIL_HOST") || env.contains("EMAIL_HOST") {
        features.insert(Feature::HasMail);
    }

    sqlite_only
}

/// Record a driver hint unless one was already found.
fn insert_driver(features: &mut BTreeSet<Feature>, driver: Feature) {
    if !features.contains(&Feature::DbMysql) && !features.contains(&Feature::DbPostgres) {
        features.insert(driver);
    }
    features.insert(Feature::HasDatabase);
}

/// Whether a lowercased manifest mentions a package name as a whole word.
fn contains_package(manifests: &str, package: &str) -> bool {
    manifests.match_indices(package).any(|(idx, _)| {
        let before = manifests[..idx].chars().next_back();
        let after = manifests[idx + package.len()..].chars().next();
        let boundary = |c: Option<char>| c.map_or(true, |c| !c.is_ascii_alphanumeric() && c != '_');
        boundary(before) && boundary(after)
    })
}
