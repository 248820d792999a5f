use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use crate::config::PublicEndpoint;

/// One generated file, path relative to the project root.
#[derive(Debug, Clone)]
pub struct ScaffoldFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ScaffoldConfig<'a> {
    pub project_id: &'a str,
    pub project_name: &'a str,
    pub description: Option<&'a str>,
    pub tagger_dep: &'a str,
    pub public: &'a PublicEndpoint,
    pub hmr_path: &'a str,
}

/// Inputs for regenerating a project's bundler config. User-supplied alias
/// blocks and plugin imports survive regeneration; everything else comes
/// from a known-good template.
#[derive(Debug, Clone, Default)]
pub struct ViteConfigExtras {
    pub extra_imports: Vec<String>,
    pub alias_block: Option<String>,
}

/// Produce the complete initial file set for a fresh project. Pure: no
/// filesystem access, deterministic for a given config.
pub fn scaffold(config: &ScaffoldConfig<'_>) -> Vec<ScaffoldFile> {
    let title = escape_html(config.project_name);
    let description = escape_html(config.description.unwrap_or("AI-generated web project"));

    vec![
        ScaffoldFile {
            path: "package.json".to_string(),
            content: package_manifest(config),
        },
        ScaffoldFile {
            path: "vite.config.ts".to_string(),
            content: generate_vite_config(
                config.project_id,
                config.public,
                config.hmr_path,
                &ViteConfigExtras::default(),
            ),
        },
        ScaffoldFile {
            path: "tsconfig.json".to_string(),
            content: TSCONFIG.to_string(),
        },
        ScaffoldFile {
            path: "tsconfig.node.json".to_string(),
            content: TSCONFIG_NODE.to_string(),
        },
        ScaffoldFile {
            path: "tailwind.config.js".to_string(),
            content: TAILWIND_CONFIG.to_string(),
        },
        ScaffoldFile {
            path: "postcss.config.js".to_string(),
            content: POSTCSS_CONFIG.to_string(),
        },
        ScaffoldFile {
            path: "index.html".to_string(),
            content: format!(
                r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1.0" />
    <meta name="description" content="{description}" />
    <title>{title}</title>
  </head>
  <body>
    <div id="root"></div>
    <script type="module" src="/src/main.tsx"></script>
  </body>
</html>
"#
            ),
        },
        ScaffoldFile {
            path: "src/index.css".to_string(),
            content: "@tailwind base;\n@tailwind components;\n@tailwind utilities;\n".to_string(),
        },
        ScaffoldFile {
            path: "src/main.tsx".to_string(),
            content: r#"import React from "react";
import ReactDOM from "react-dom/client";
import App from "./App";
import "./index.css";

ReactDOM.createRoot(document.getElementById("root")!).render(
  <React.StrictMode>
    <App />
  </React.StrictMode>,
);
"#
            .to_string(),
        },
        ScaffoldFile {
            path: "src/App.tsx".to_string(),
            content: format!(
                r#"export default function App() {{
  return (
    <div className="min-h-screen flex items-center justify-center bg-gray-50">
      <h1 className="text-2xl font-semibold text-gray-800">{title}</h1>
    </div>
  );
}}
"#
            ),
        },
    ]
}

fn package_manifest(config: &ScaffoldConfig<'_>) -> String {
    let manifest = json!({
        "name": slugify(config.project_name),
        "private": true,
        "version": "0.0.0",
        "type": "module",
        "scripts": {
            "dev": "vite",
            "build": "vite build",
            "preview": "vite preview"
        },
        "dependencies": {
            "react": "^18.3.0",
            "react-dom": "^18.3.0"
        },
        "devDependencies": {
            "@types/react": "^18.3.0",
            "@types/react-dom": "^18.3.0",
            "@vitejs/plugin-react": "^4.3.0",
            "autoprefixer": "^10.4.0",
            "postcss": "^8.4.0",
            "tailwindcss": "^3.4.0",
            "typescript": "^5.5.0",
            "vite": "^5.4.0",
            "vite-plugin-jsx-tagger": config.tagger_dep
        }
    });
    let mut out = serde_json::to_string_pretty(&manifest).expect("static manifest serialises");
    out.push('\n');
    out
}

/// Regenerate `vite.config.ts` for a project. The tagging plugin must sit
/// ahead of the framework plugin so it sees original source locations, and
/// the HMR block points browsers back at the public endpoint.
pub fn generate_vite_config(
    project_id: &str,
    public: &PublicEndpoint,
    hmr_path: &str,
    extras: &ViteConfigExtras,
) -> String {
    let id_prefix: String = project_id.chars().take(8).collect();
    let extra_imports = if extras.extra_imports.is_empty() {
        String::new()
    } else {
        format!("{}\n", extras.extra_imports.join("\n"))
    };
    let resolve_section = match &extras.alias_block {
        Some(alias) => format!("  resolve: {{\n    alias: {alias},\n  }},\n"),
        None => String::new(),
    };

    format!(
        r#"import {{ defineConfig }} from "vite";
import react from "@vitejs/plugin-react";
import jsxTagger from "vite-plugin-jsx-tagger";
{extra_imports}
export default defineConfig({{
  plugins: [
    jsxTagger({{ idPrefix: "{id_prefix}" }}),
    react(),
  ],
  base: "/p/{project_id}/",
{resolve_section}  server: {{
    host: "0.0.0.0",
    allowedHosts: true,
    hmr: {{
      protocol: "{protocol}",
      host: "{host}",
      clientPort: {client_port},
      path: "{hmr_path}/{project_id}",
    }},
  }},
}});
"#,
        protocol = public.ws_protocol(),
        host = public.host,
        client_port = public.client_port(),
    )
}

/// Pull user customisations worth keeping out of an existing bundler
/// config before regenerating it: a `resolve.alias` block and any import
/// lines beyond the standard three.
pub fn extract_extras(source: &str) -> ViteConfigExtras {
    static ALIAS_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"alias:\s*(\{[^}]*\})").expect("alias regex compiles"));
    static IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r#"(?m)^import\s.+?from\s+["']([^"']+)["'];?\s*$"#)
            .expect("import regex compiles")
    });

    let alias_block = ALIAS_RE
        .captures(source)
        .map(|c| c[1].trim().to_string());

    let extra_imports = IMPORT_RE
        .captures_iter(source)
        .filter(|c| {
            let module = &c[1];
            module != "vite" && module != "@vitejs/plugin-react" && module != "vite-plugin-jsx-tagger"
        })
        .map(|c| c[0].trim_end().to_string())
        .collect();

    ViteConfigExtras {
        extra_imports,
        alias_block,
    }
}

/// Lowercase, collapse anything non-alphanumeric to single dashes, trim.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "project".to_string()
    } else {
        slug
    }
}

/// Escape a string for interpolation into HTML text or attribute values.
pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

const TSCONFIG: &str = r#"{
  "compilerOptions": {
    "target": "ES2020",
    "useDefineForClassFields": true,
    "lib": ["ES2020", "DOM", "DOM.Iterable"],
    "module": "ESNext",
    "skipLibCheck": true,
    "moduleResolution": "bundler",
    "allowImportingTsExtensions": true,
    "resolveJsonModule": true,
    "isolatedModules": true,
    "noEmit": true,
    "jsx": "react-jsx",
    "strict": true
  },
  "include": ["src"],
  "references": [{ "path": "./tsconfig.node.json" }]
}
"#;

const TSCONFIG_NODE: &str = r#"{
  "compilerOptions": {
    "composite": true,
    "skipLibCheck": true,
    "module": "ESNext",
    "moduleResolution": "bundler",
    "allowSyntheticDefaultImports": true
  },
  "include": ["vite.config.ts"]
}
"#;

const TAILWIND_CONFIG: &str = r#"/** @type {import('tailwindcss').Config} */
export default {
  content: ["./index.html", "./src/**/*.{js,ts,jsx,tsx}"],
  theme: {
    extend: {},
  },
  plugins: [],
};
"#;

const POSTCSS_CONFIG: &str = r#"export default {
  plugins: {
    tailwindcss: {},
    autoprefixer: {},
  },
};
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn public() -> PublicEndpoint {
        PublicEndpoint {
            host: "omniflow-preview.fly.dev".into(),
            https: true,
            port: 3000,
        }
    }

    fn config<'a>(public: &'a PublicEndpoint) -> ScaffoldConfig<'a> {
        ScaffoldConfig {
            project_id: "a1b2c3d4-e5f6-7890-abcd-ef0123456789",
            project_name: "My <Demo> Project",
            description: Some("says \"hi\""),
            tagger_dep: "file:/app/packages/vite-plugin-jsx-tagger",
            public,
            hmr_path: "/hmr",
        }
    }

    #[test]
    fn emits_the_full_file_set() {
        let p = public();
        let files = scaffold(&config(&p));
        let names: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        for expected in [
            "package.json",
            "vite.config.ts",
            "tsconfig.json",
            "tsconfig.node.json",
            "tailwind.config.js",
            "postcss.config.js",
            "index.html",
            "src/index.css",
            "src/main.tsx",
            "src/App.tsx",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn html_entry_escapes_user_fields() {
        let p = public();
        let files = scaffold(&config(&p));
        let html = &files.iter().find(|f| f.path == "index.html").unwrap().content;
        assert!(html.contains("My &lt;Demo&gt; Project"));
        assert!(html.contains("says &quot;hi&quot;"));
        assert!(!html.contains("<Demo>"));
    }

    #[test]
    fn manifest_uses_slug_and_tagger_dep() {
        let p = public();
        let files = scaffold(&config(&p));
        let manifest: serde_json::Value =
            serde_json::from_str(&files.iter().find(|f| f.path == "package.json").unwrap().content)
                .unwrap();
        assert_eq!(manifest["name"], "my-demo-project");
        assert_eq!(
            manifest["devDependencies"]["vite-plugin-jsx-tagger"],
            "file:/app/packages/vite-plugin-jsx-tagger"
        );
    }

    #[test]
    fn vite_config_wires_base_hmr_and_plugin_order() {
        let p = public();
        let cfg = generate_vite_config(
            "a1b2c3d4-rest",
            &p,
            "/hmr",
            &ViteConfigExtras::default(),
        );
        assert!(cfg.contains("base: \"/p/a1b2c3d4-rest/\""));
        assert!(cfg.contains("path: \"/hmr/a1b2c3d4-rest\""));
        assert!(cfg.contains("protocol: \"wss\""));
        assert!(cfg.contains("clientPort: 443"));
        assert!(cfg.contains("idPrefix: \"a1b2c3d4\""));
        let tagger_at = cfg.find("jsxTagger(").unwrap();
        let react_at = cfg.find("react(),").unwrap();
        assert!(tagger_at < react_at, "tagger plugin must precede react");
    }

    #[test]
    fn vite_config_preserves_alias_and_extra_imports() {
        let p = PublicEndpoint {
            host: "localhost".into(),
            https: false,
            port: 3000,
        };
        let extras = ViteConfigExtras {
            extra_imports: vec!["import path from \"path\";".to_string()],
            alias_block: Some("{ \"@\": path.resolve(__dirname, \"./src\") }".to_string()),
        };
        let cfg = generate_vite_config("proj", &p, "/hmr", &extras);
        assert!(cfg.contains("import path from \"path\";"));
        assert!(cfg.contains("alias: { \"@\": path.resolve(__dirname, \"./src\") }"));
        assert!(cfg.contains("protocol: \"ws\""));
        assert!(cfg.contains("clientPort: 3000"));
    }

    #[test]
    fn extract_extras_finds_alias_and_foreign_imports() {
        let source = r#"import { defineConfig } from "vite";
import react from "@vitejs/plugin-react";
import path from "path";
import svgr from "vite-plugin-svgr";

export default defineConfig({
  plugins: [react(), svgr()],
  resolve: {
    alias: { "@": path.resolve(__dirname, "./src") },
  },
});
"#;
        let extras = extract_extras(source);
        assert_eq!(extras.extra_imports.len(), 2);
        assert!(extras.extra_imports[0].contains("\"path\""));
        assert!(extras.extra_imports[1].contains("vite-plugin-svgr"));
        assert_eq!(
            extras.alias_block.as_deref(),
            Some("{ \"@\": path.resolve(__dirname, \"./src\") }")
        );
    }

    #[test]
    fn extract_extras_is_empty_for_generated_configs() {
        let p = public();
        let generated =
            generate_vite_config("proj", &p, "/hmr", &ViteConfigExtras::default());
        let extras = extract_extras(&generated);
        assert!(extras.extra_imports.is_empty());
        assert!(extras.alias_block.is_none());
    }

    #[test]
    fn slugify_collapses_and_trims() {
        assert_eq!(slugify("My Demo Project"), "my-demo-project");
        assert_eq!(slugify("  --Hello!!World--  "), "hello-world");
        assert_eq!(slugify("***"), "project");
    }
}
