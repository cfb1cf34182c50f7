use anyhow::{Context, Result};
use minijinja::{AutoEscape, Environment, context};
use serde_json::json;
use std::path::Path;

use crate::sandbox::FileMap;

/// Embedded Dockerfile for the sandbox runtime image.
/// The source tree is bind-mounted at `source_root`, so the image only needs
/// the toolchain and the dev server entrypoint.
pub const SANDBOX_DOCKERFILE: &str = r#"FROM node:20-alpine

RUN apk add --no-cache findutils

WORKDIR {{ source_root }}

ENV NEXT_TELEMETRY_DISABLED=1
ENV PORT={{ app_port }}

EXPOSE {{ app_port }}

# Dependencies are installed on start because package.json lives in the bind mount
CMD ["sh", "-c", "npm install --no-audit --no-fund && npx next dev --hostname 0.0.0.0 --port {{ app_port }}"]
"#;

pub type TemplateEnv = Environment<'static>;

/// Create and configure the template environment with escape settings.
pub fn create_template_env() -> TemplateEnv {
    let mut env = Environment::new();
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env.set_keep_trailing_newline(true);
    env
}

/// Read the Dockerfile template, falling back to the embedded one.
pub fn load_dockerfile_template(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read Dockerfile template {}", path.display())),
        None => Ok(SANDBOX_DOCKERFILE.to_string()),
    }
}

/// Render a Dockerfile template for the given in-sandbox layout.
pub fn render_dockerfile(
    template: &str,
    env: &TemplateEnv,
    app_port: u16,
    source_root: &str,
) -> Result<String> {
    env.render_str(
        template,
        context! { app_port => app_port, source_root => source_root },
    )
    .context("Failed to render Dockerfile template")
}

/// Files every new sandbox starts with: a minimal Next.js app.
pub fn default_app_files() -> FileMap {
    let package = json!({
        "name": "my-nextjs-app",
        "version": "0.1.0",
        "private": true,
        "scripts": {
            "dev": "next dev",
            "build": "next build",
            "start": "next start",
            "lint": "next lint",
        },
        "dependencies": {
            "next": "13.4.19",
            "react": "^18.2.0",
            "react-dom": "^18.2.0",
        },
        "devDependencies": {
            "@types/node": "^20",
            "@types/react": "^18",
            "@types/react-dom": "^18",
            "typescript": "^5",
        },
    });

    let mut files = FileMap::new();
    files.insert(
        "package.json".to_string(),
        serde_json::to_string_pretty(&package).unwrap_or_default(),
    );
    files.insert(
        "pages/index.tsx".to_string(),
        r#"export default function Home() {
  return (
    <div>
      <h1>Welcome to December!</h1>
      <p>Your Next.js app is running.</p>
    </div>
  );
}
"#
        .to_string(),
    );
    files
}
