// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use regex::Regex;

/// Collapses dynamic path segments so that requests to the same route
/// aggregate together.
///
/// Rules run in order, case-insensitively:
/// UUID, 24-hex object id, 32-hex hash, numeric token, then dashed slugs.
#[derive(Debug, Clone)]
pub struct PathNormalizer {
    rules: Vec<(Regex, &'static str)>,
}

impl PathNormalizer {
    pub fn new() -> Result<Self, regex::Error> {
        let rules = [
            (
                r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
                ":uuid",
            ),
            (r"(?i)\b[0-9a-f]{24}\b", ":objectId"),
            (r"(?i)\b[0-9a-f]{32}\b", ":hash"),
            (r"\b\d+\b", ":id"),
            (r"(?i)/[a-z0-9]*-[a-z0-9\-]*", "/:slug"),
        ]
        .into_iter()
        .map(|(pattern, replacement)| Ok((Regex::new(pattern)?, replacement)))
        .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules })
    }

    pub fn normalize(&self, path: &str) -> String {
        self.rules
            .iter()
            .fold(path.to_string(), |path, (rule, replacement)| {
                rule.replace_all(&path, *replacement).into_owned()
            })
    }
}
