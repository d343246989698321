//! Integration tests for project analysis and blueprint resolution.

use std::fs;
use std::path::Path;

use devstack::blueprint::{resolve, Overrides, RoleName};
use devstack::error::BlueprintError;
use devstack::project::{analyze, Feature, ProjectKind};
use tempfile::TempDir;

fn write(dir: &Path, name: &str, content: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

#[test]
fn test_django_with_postgres_and_redis() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path();

    write(path, "manage.py", "#!/usr/bin/env python\n");
    write(path, "requirements.txt", "Django==5.0\npsycopg[binary]==3.1\ndjango-redis==5.4\n");
    write(
        path,
        "mysite/settings.py",
        "DATABASES = {'default': {'ENGINE': 'django.db.backends.postgresql'}}\n",
    );

    let project = analyze(path).unwrap();
    assert_eq!(project.kind, ProjectKind::Python);
    assert!(project.has(Feature::Django));
    assert!(project.has(Feature::DbPostgres));
    assert!(project.has(Feature::HasDatabase));

    let blueprint = resolve(&project, &Overrides::default()).unwrap();
    let roles = blueprint.role_names();
    assert!(roles.contains(&RoleName::App));
    assert!(roles.contains(&RoleName::Db));

    let app = blueprint.role(RoleName::App).unwrap();
    let command = app.spec.command.as_ref().unwrap().join(" ");
    assert!(command.contains("manage.py runserver"));
    assert_eq!(blueprint.role(RoleName::Db).unwrap().spec.image, "postgres:16-alpine");
}

#[test]
fn test_flask_project() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path();
    write(path, "pyproject.toml", "[project]\ndependencies = [\"flask>=3\"]\n");

    let project = analyze(path).unwrap();
    assert_eq!(project.kind, ProjectKind::Python);
    assert!(project.has(Feature::Flask));
    assert!(!project.has(Feature::HasDatabase));

    let blueprint = resolve(&project, &Overrides::default()).unwrap();
    assert_eq!(blueprint.role_names(), vec![RoleName::App]);
    let command = blueprint.role(RoleName::App).unwrap().spec.command.as_ref().unwrap().join(" ");
    assert!(command.contains("flask run"));
}

#[test]
fn test_symfony_with_mailer() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path();
    write(
        path,
        "composer.json",
        r#"{"require": {"symfony/framework-bundle": "^7.0", "doctrine/orm": "^3.0", "symfony/mailer": "^7.0"}}"#,
    );
    write(path, "symfony.lock", "{}");

    let project = analyze(path).unwrap();
    assert_eq!(project.kind, ProjectKind::Php);
    assert!(project.has(Feature::Symfony));
    assert!(project.has(Feature::HasDatabase));
    assert!(project.has(Feature::HasMail));

    let blueprint = resolve(&project, &Overrides::default()).unwrap();
    let app = blueprint.role(RoleName::App).unwrap();
    assert_eq!(app.spec.env["APACHE_DOCUMENT_ROOT"], "/var/www/html/public");
    assert!(blueprint.role(RoleName::Mail).is_some());
    // Without a driver hint the database defaults to postgres
    assert_eq!(blueprint.role(RoleName::Db).unwrap().spec.image, "postgres:16-alpine");
}

#[test]
fn test_unknown_directory_gets_static_app() {
    let temp_dir = TempDir::new().unwrap();
    write(temp_dir.path(), "README.md", "# notes\n");

    let project = analyze(temp_dir.path()).unwrap();
    assert_eq!(project.kind, ProjectKind::Unknown);
    assert!(project.features.is_empty());

    let blueprint = resolve(&project, &Overrides::default()).unwrap();
    assert_eq!(blueprint.role_names(), vec![RoleName::App]);
    assert_eq!(blueprint.role(RoleName::App).unwrap().spec.image, "nginx:alpine");
}

#[test]
fn test_override_file_changes_blueprint() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path();
    write(path, "index.php", "<?php\n");
    write(
        path,
        ".devstack.toml",
        "[env]\nAPP_DEBUG = \"true\"\n\n[services.db]\nenabled = true\nimage = \"mariadb:11\"\n",
    );

    let project = analyze(path).unwrap();
    let overrides = Overrides::load(&project.path).unwrap();
    let blueprint = resolve(&project, &overrides).unwrap();

    assert_eq!(blueprint.role(RoleName::Db).unwrap().spec.image, "mariadb:11");
    assert_eq!(blueprint.env_overrides["APP_DEBUG"], "true");
}

#[test]
fn test_unresolved_hard_dependency() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path();
    write(path, "index.php", "<?php\n");

    let project = analyze(path).unwrap();
    let mut overrides = Overrides::default();
    overrides.role_mut("app").depends_on = Some(vec!["cache".to_string()]);

    let err = resolve(&project, &overrides).unwrap_err();
    match err {
        BlueprintError::UnresolvedDependency { role, dependency, .. } => {
            assert_eq!(role, "app");
            assert_eq!(dependency, "cache");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_analyze_rejects_files() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("composer.json");
    fs::write(&file, "{}").unwrap();

    assert!(analyze(&file).is_err());
    assert!(analyze(temp_dir.path().join("missing")).is_err());
}
