use std::{collections::HashMap, fs, io, path::Path};

/// Parse a shell-style `KEY=VALUE` environment file. `export ` prefixes,
/// surrounding single or double quotes and `#` comments are tolerated.
pub fn parse(path: &Path) -> io::Result<HashMap<String, String>> {
    Ok(parse_str(&fs::read_to_string(path)?))
}

pub fn parse_str(raw: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for raw_line in raw.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("export ") {
            line = rest.trim();
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim();
        let bytes = value.as_bytes();
        if bytes.len() >= 2
            && (bytes[0] == b'\'' || bytes[0] == b'"')
            && bytes[0] == bytes[bytes.len() - 1]
        {
            value = &value[1..value.len() - 1];
        }
        values.insert(key.to_owned(), value.to_owned());
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_parses_plain_and_exported_assignments() {
        let env = parse_str(
            "# appliance config\n\
             CNC_MASTER_DIR=/var/lib/cnc-control/master\n\
             export CNC_ACTIVE_SLOT=B\n\
             \n\
             CNC_USB_LABEL=\"CNC USB\"\n\
             CNC_SHADOW_TMP_SUFFIX='.tmp'\n\
             not a assignment\n",
        );

        assert_eq!(
            env.get("CNC_MASTER_DIR").map(String::as_str),
            Some("/var/lib/cnc-control/master")
        );
        assert_eq!(env.get("CNC_ACTIVE_SLOT").map(String::as_str), Some("B"));
        assert_eq!(env.get("CNC_USB_LABEL").map(String::as_str), Some("CNC USB"));
        assert_eq!(
            env.get("CNC_SHADOW_TMP_SUFFIX").map(String::as_str),
            Some(".tmp")
        );
        assert_eq!(env.len(), 4);
    }

    #[test]
    fn it_ignores_comments_and_malformed_lines() {
        let env = parse_str("# only comments\n   \n=nokey\n");
        assert!(env.is_empty());
    }
}
