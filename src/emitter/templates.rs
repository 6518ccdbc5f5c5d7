//! # Template Stratum
//!
//! Infrastructure files that do not depend on the domain IR: container
//! definitions, observability config, the package manifest, the health
//! route, the base ORM model, and migration tooling. Output is
//! byte-identical for a given template version and infrastructure model;
//! no entity or field name may appear here (the emission lint enforces it).

use crate::ir::{DatabaseKind, InfrastructureModel};
use crate::lowering::normalize;

/// Bumped whenever any template text changes; part of the determinism
/// contract.
pub const TEMPLATE_VERSION: &str = "2024.3";

/// One rendered template file.
#[derive(Debug, Clone)]
pub struct TemplateFile {
    pub path: &'static str,
    pub source_id: String,
    pub content: String,
}

fn template(path: &'static str, name: &str, content: String) -> TemplateFile {
    TemplateFile {
        path,
        source_id: format!("template:{name}@{TEMPLATE_VERSION}"),
        content,
    }
}

/// Render the full template set for an application.
pub fn render_all(app_name: &str, infra: &InfrastructureModel) -> Vec<TemplateFile> {
    vec![
        dockerfile(infra),
        compose(app_name, infra),
        observability(),
        pyproject(app_name),
        config_module(infra),
        health_route(),
        base_model(),
        db_module(),
        alembic_ini(),
        migrations_env(),
    ]
}

fn python_tag(runtime: &str) -> &str {
    runtime.strip_prefix("python").unwrap_or("3.12")
}

pub fn dockerfile(infra: &InfrastructureModel) -> TemplateFile {
    let tag = python_tag(&infra.runtime);
    let port = infra.app_port();
    let content = format!(
        "FROM python:{tag}-slim\n\n\
         WORKDIR /app\n\n\
         COPY pyproject.toml ./\n\
         RUN pip install --no-cache-dir .\n\n\
         COPY src ./src\n\
         COPY migrations ./migrations\n\
         COPY alembic.ini ./\n\n\
         EXPOSE {port}\n\n\
         CMD [\"uvicorn\", \"src.main:app\", \"--host\", \"0.0.0.0\", \"--port\", \"{port}\"]\n"
    );
    template("Dockerfile", "dockerfile", content)
}

fn db_service(kind: DatabaseKind) -> (&'static str, &'static str, u16) {
    match kind {
        DatabaseKind::Postgres => ("db", "postgres:16-alpine", 5432),
        DatabaseKind::Mysql => ("db", "mysql:8", 3306),
        DatabaseKind::Sqlite => ("db", "", 0),
    }
}

pub fn compose(app_name: &str, infra: &InfrastructureModel) -> TemplateFile {
    let port = infra.app_port();
    let app = normalize::to_snake_case(app_name);
    let (svc, image, db_port) = db_service(infra.database);

    let mut content = String::new();
    content.push_str("services:\n");
    content.push_str("  api:\n");
    content.push_str("    build: .\n");
    content.push_str(&format!("    ports:\n      - \"{port}:{port}\"\n"));
    content.push_str(&format!(
        "    healthcheck:\n      test: [\"CMD\", \"python\", \"-c\", \"import urllib.request; \
         urllib.request.urlopen('http://localhost:{port}{}')\"]\n      interval: 5s\n      \
         timeout: 3s\n      retries: 10\n",
        infra.health_path
    ));
    if !image.is_empty() {
        content.push_str("    depends_on:\n");
        content.push_str(&format!("      {svc}:\n        condition: service_started\n"));
        content.push_str("    environment:\n");
        content.push_str(&format!(
            "      DATABASE_URL: \"{}\"\n",
            database_url(infra.database, svc, db_port, &app)
        ));
        content.push_str(&format!("  {svc}:\n    image: {image}\n"));
        content.push_str(&format!(
            "    environment:\n      POSTGRES_DB: \"{app}\"\n      POSTGRES_USER: \"app\"\n      \
             POSTGRES_PASSWORD: \"app\"\n"
        ));
        content.push_str(&format!("    ports:\n      - \"{db_port}:{db_port}\"\n"));
    }
    template("docker-compose.yml", "compose", content)
}

fn database_url(kind: DatabaseKind, host: &str, port: u16, db: &str) -> String {
    match kind {
        DatabaseKind::Postgres => format!("postgresql+psycopg://app:app@{host}:{port}/{db}"),
        DatabaseKind::Mysql => format!("mysql+pymysql://app:app@{host}:{port}/{db}"),
        DatabaseKind::Sqlite => format!("sqlite:///./{db}.db"),
    }
}

pub fn observability() -> TemplateFile {
    let content = "\
logging:\n  level: INFO\n  format: json\n\
metrics:\n  enabled: true\n  namespace: app\n\
tracing:\n  enabled: false\n"
        .to_string();
    template("observability.yaml", "observability", content)
}

pub fn pyproject(app_name: &str) -> TemplateFile {
    let app = normalize::to_snake_case(app_name);
    let content = format!(
        "[project]\n\
         name = \"{app}\"\n\
         version = \"0.1.0\"\n\
         requires-python = \">=3.12\"\n\
         dependencies = [\n\
         \x20   \"fastapi>=0.111\",\n\
         \x20   \"uvicorn>=0.30\",\n\
         \x20   \"sqlalchemy>=2.0\",\n\
         \x20   \"pydantic>=2.7\",\n\
         \x20   \"alembic>=1.13\",\n\
         \x20   \"psycopg[binary]>=3.1\",\n\
         ]\n\n\
         [build-system]\n\
         requires = [\"setuptools>=61\"]\n\
         build-backend = \"setuptools.build_meta\"\n"
    );
    template("pyproject.toml", "pyproject", content)
}

pub fn config_module(infra: &InfrastructureModel) -> TemplateFile {
    let port = infra.app_port();
    let default_url = database_url(infra.database, "localhost", db_service(infra.database).2, "app");
    let content = format!(
        "\"\"\"Application settings loaded from the environment.\"\"\"\n\
         import os\n\n\
         from pydantic import BaseModel\n\n\n\
         class Settings(BaseModel):\n\
         \x20   database_url: str = os.environ.get(\"DATABASE_URL\", \"{default_url}\")\n\
         \x20   port: int = int(os.environ.get(\"PORT\", \"{port}\"))\n\
         \x20   log_level: str = os.environ.get(\"LOG_LEVEL\", \"INFO\")\n\n\n\
         settings = Settings()\n"
    );
    template("src/core/config.py", "config_module", content)
}

pub fn health_route() -> TemplateFile {
    let content = "\
\"\"\"Liveness and metrics endpoints.\"\"\"\n\
from fastapi import APIRouter\n\n\
router = APIRouter()\n\n\n\
@router.get(\"/health\")\n\
def health() -> dict:\n\
    return {\"status\": \"ok\"}\n\n\n\
@router.get(\"/metrics\")\n\
def metrics() -> dict:\n\
    return {\"status\": \"ok\", \"requests\": None}\n"
        .to_string();
    template("src/routes/health.py", "health_route", content)
}

pub fn base_model() -> TemplateFile {
    let content = "\
\"\"\"Declarative base shared by all ORM models.\"\"\"\n\
from sqlalchemy.orm import DeclarativeBase\n\n\n\
class Base(DeclarativeBase):\n\
    pass\n"
        .to_string();
    template("src/models/base.py", "base_model", content)
}

pub fn db_module() -> TemplateFile {
    let content = "\
\"\"\"Engine and session management.\"\"\"\n\
from sqlalchemy import create_engine\n\
from sqlalchemy.orm import Session, sessionmaker\n\n\
from src.core.config import settings\n\
from src.models.base import Base\n\n\
engine = create_engine(settings.database_url)\n\
SessionLocal = sessionmaker(bind=engine)\n\n\n\
def init_db() -> None:\n\
\x20   import src.models.entities  # noqa: F401\n\
\x20   Base.metadata.create_all(engine)\n\n\n\
def get_session() -> Session:\n\
\x20   session = SessionLocal()\n\
\x20   try:\n\
\x20       yield session\n\
\x20   finally:\n\
\x20       session.close()\n"
        .to_string();
    template("src/core/db.py", "db_module", content)
}

pub fn alembic_ini() -> TemplateFile {
    let content = "\
[alembic]\n\
script_location = migrations\n\
prepend_sys_path = .\n\n\
[loggers]\n\
keys = root\n\n\
[handlers]\n\
keys = console\n\n\
[formatters]\n\
keys = generic\n\n\
[logger_root]\n\
level = WARN\n\
handlers = console\n\n\
[handler_console]\n\
class = StreamHandler\n\
args = (sys.stderr,)\n\
level = NOTSET\n\
formatter = generic\n\n\
[formatter_generic]\n\
format = %(levelname)-5.5s [%(name)s] %(message)s\n"
        .to_string();
    template("alembic.ini", "alembic_ini", content)
}

pub fn migrations_env() -> TemplateFile {
    let content = "\
\"\"\"Alembic environment wired to the application settings.\"\"\"\n\
from alembic import context\n\
from sqlalchemy import engine_from_config, pool\n\n\
from src.core.config import settings\n\
from src.models.base import Base\n\n\
config = context.config\n\
config.set_main_option(\"sqlalchemy.url\", settings.database_url)\n\
target_metadata = Base.metadata\n\n\n\
def run_migrations_online() -> None:\n\
    connectable = engine_from_config(\n\
        config.get_section(config.config_ini_section, {}),\n\
        prefix=\"sqlalchemy.\",\n\
        poolclass=pool.NullPool,\n\
    )\n\
    with connectable.connect() as connection:\n\
        context.configure(connection=connection, target_metadata=target_metadata)\n\
        with context.begin_transaction():\n\
            context.run_migrations()\n\n\n\
run_migrations_online()\n"
        .to_string();
    template("migrations/env.py", "migrations_env", content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_are_deterministic() {
        let infra = InfrastructureModel::default();
        let a = render_all("DemoShop", &infra);
        let b = render_all("DemoShop", &infra);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.path, y.path);
            assert_eq!(x.content, y.content);
        }
    }

    #[test]
    fn test_source_ids_carry_template_version() {
        let infra = InfrastructureModel::default();
        for file in render_all("DemoShop", &infra) {
            assert!(file.source_id.contains(TEMPLATE_VERSION), "{}", file.path);
        }
    }

    #[test]
    fn test_compose_exposes_app_port() {
        let infra = InfrastructureModel::default();
        let file = compose("DemoShop", &infra);
        assert!(file.content.contains("\"8000:8000\""));
    }
}
