use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::errors::LoadError;

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonLabels {
    List(Vec<String>),
    Indexed(BTreeMap<String, String>),
}

/// Reads the class-index-to-name table. Plain text files hold one name per
/// line; `.json` files hold either an array or an `{"0": "name"}` object.
pub fn load_labels(path: &Path) -> Result<Vec<String>, LoadError> {
    let content = fs::read_to_string(path).map_err(|source| LoadError::Labels {
        path: path.to_path_buf(),
        source,
    })?;

    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let labels = if is_json {
        parse_json(&content).map_err(|reason| LoadError::MalformedLabels {
            path: path.to_path_buf(),
            reason,
        })?
    } else {
        parse_lines(&content)
    };

    if labels.is_empty() {
        return Err(LoadError::NoLabels(path.to_path_buf()));
    }

    Ok(labels)
}

fn parse_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_json(content: &str) -> Result<Vec<String>, String> {
    let parsed: JsonLabels = serde_json::from_str(content).map_err(|e| e.to_string())?;
    match parsed {
        JsonLabels::List(names) => Ok(names),
        JsonLabels::Indexed(map) => {
            let mut indexed = Vec::with_capacity(map.len());
            for (key, name) in map {
                let index: usize = key
                    .trim()
                    .parse()
                    .map_err(|_| format!("class index {key:?} is not a number"))?;
                indexed.push((index, name));
            }
            indexed.sort_by_key(|(index, _)| *index);

            for (expected, (index, _)) in indexed.iter().enumerate() {
                if *index != expected {
                    return Err(format!("class indices must be dense, missing {expected}"));
                }
            }

            Ok(indexed.into_iter().map(|(_, name)| name).collect())
        }
    }
}
