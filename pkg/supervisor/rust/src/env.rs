// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::ServiceConfig;
use crate::errors::{Error, Result};
use std::collections::BTreeMap;

/// Replace every `${key}` whose key appears in `params`. Unknown keys and
/// unterminated `${` are left untouched. Later pairs override earlier ones.
pub fn expand_placeholders(input: &str, params: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        let (before, after) = rest.split_at(start);
        out.push_str(before);
        let Some(end) = after.find('}') else {
            out.push_str(after);
            return out;
        };
        let key = after.get(2..end).unwrap_or_default();
        match params.iter().rev().find(|(k, _)| *k == key) {
            Some((_, v)) => out.push_str(v),
            None => out.push_str(after.get(..=end).unwrap_or_default()),
        }
        rest = after.get(end + 1..).unwrap_or_default();
    }
    out.push_str(rest);
    out
}

/// Parse a systemd-style environment file into key-value pairs.
/// Supports `KEY=VALUE`, `KEY="VALUE"`, `KEY='VALUE'`, comments (#), and blank lines.
/// A leading `-` on the path marks the file optional.
pub fn parse_environment_file(path: &str) -> Result<Vec<(String, String)>> {
    let (path, optional) = match path.strip_prefix('-') {
        Some(p) => (p, true),
        None => (path, false),
    };
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if optional && e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(format!("reading environment file {path}"), e)),
    };
    let mut vars = Vec::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, raw_val)) = trimmed.split_once('=') {
            let val = raw_val
                .trim()
                .trim_matches('"')
                .trim_matches('\'')
                .to_string();
            vars.push((key.trim().to_string(), val));
        }
    }
    Ok(vars)
}

/// Assemble the child environment: parent (when inherited), then the
/// environment file, then the explicit `env` map. Values go through
/// placeholder expansion like program and args do.
pub fn build_environment(
    config: &ServiceConfig,
    params: &[(&str, &str)],
) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    if config.inherit_env {
        vars.extend(std::env::vars());
    }
    if let Some(ref file) = config.environment_file {
        let file = expand_placeholders(file, params);
        vars.extend(parse_environment_file(&file)?);
    }
    for (k, v) in &config.env {
        vars.insert(k.clone(), expand_placeholders(v, params));
    }
    Ok(vars)
}
