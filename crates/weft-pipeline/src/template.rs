use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use weft_core::ParameterSchema;
use weft_core::codegen::{DECLARATION_FILE, generate_type_declarations};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    TypeScript,
}

impl Language {
    pub fn from_typescript(is_typescript: bool) -> Self {
        if is_typescript {
            Language::TypeScript
        } else {
            Language::JavaScript
        }
    }

    pub fn is_typescript(self) -> bool {
        self == Language::TypeScript
    }

    /// Entry file name relative to the source root.
    pub fn entry_file(self) -> &'static str {
        match self {
            Language::JavaScript => "index.js",
            Language::TypeScript => "index.ts",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
        })
    }
}

const JS_ENTRY: &str = r#"/**
 * Called once per solve.
 *
 * @param {Component.Inputs} inputs values of the input slots, keyed by variable name
 * @param {Component.Context} context
 * @returns {Promise<Component.Outputs>} values for the output slots, keyed by variable name
 */
export async function runScript(inputs, context) {
  const sum = (inputs.a ?? 0) + (inputs.b ?? 0);
  return { x: sum };
}
"#;

const TS_ENTRY: &str = r#"/// <reference path="./types/component.d.ts" />

/**
 * Called once per solve.
 *
 * @param inputs values of the input slots, keyed by variable name
 * @returns values for the output slots, keyed by variable name
 */
export async function runScript(
  inputs: Component.Inputs,
  context: Component.Context,
): Promise<Component.Outputs> {
  const sum = (inputs.a ?? 0) + (inputs.b ?? 0);
  return { x: sum };
}
"#;

const TSCONFIG: &str = r#"{
  "compilerOptions": {
    "target": "ES2020",
    "module": "ESNext",
    "moduleResolution": "Bundler",
    "strict": true,
    "noEmit": true,
    "skipLibCheck": true
  },
  "include": ["**/*.ts"],
  "exclude": ["node_modules", "bin", "obj"]
}
"#;

fn package_json(language: Language) -> String {
    let dev_dependencies = match language {
        Language::JavaScript => r#"    "esbuild": "^0.24.0""#,
        Language::TypeScript => "    \"esbuild\": \"^0.24.0\",\n    \"typescript\": \"^5.6.0\"",
    };
    format!(
        r#"{{
  "name": "weft-component",
  "version": "1.0.0",
  "private": true,
  "type": "module",
  "main": "{entry}",
  "devDependencies": {{
{dev_dependencies}
  }}
}}
"#,
        entry = language.entry_file(),
    )
}

/// Write a fresh project into `dir` and return the entry path.
pub fn scaffold(
    dir: &Path,
    language: Language,
    schema: &ParameterSchema,
) -> Result<PathBuf, PipelineError> {
    std::fs::create_dir_all(dir)?;

    let entry = dir.join(language.entry_file());
    std::fs::write(
        &entry,
        match language {
            Language::JavaScript => JS_ENTRY,
            Language::TypeScript => TS_ENTRY,
        },
    )?;
    std::fs::write(dir.join("package.json"), package_json(language))?;

    if language.is_typescript() {
        std::fs::write(dir.join("tsconfig.json"), TSCONFIG)?;
        write_type_declarations(dir, schema)?;
    }

    tracing::debug!(dir = %dir.display(), %language, "Scaffolded component source");
    Ok(entry)
}

/// Regenerate `types/component.d.ts`. Returns whether the file was written;
/// an unchanged declaration leaves the file alone so watchers stay quiet.
pub fn write_type_declarations(
    dir: &Path,
    schema: &ParameterSchema,
) -> Result<bool, PipelineError> {
    let path = dir.join(DECLARATION_FILE);
    let text = generate_type_declarations(schema);
    if std::fs::read_to_string(&path).is_ok_and(|existing| existing == text) {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, text)?;
    Ok(true)
}

/// The entry file present in `dir`, preferring TypeScript.
pub fn find_entry(dir: &Path) -> Option<(PathBuf, Language)> {
    [Language::TypeScript, Language::JavaScript]
        .into_iter()
        .map(|language| (dir.join(language.entry_file()), language))
        .find(|(path, _)| path.is_file())
}
