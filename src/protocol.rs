//! The v2 smart-HTTP protocol driver — discovery, ls-refs, want
//! resolution, fetch-command construction, and pack extraction from the
//! side-band response.

use chrono::Datelike;

use crate::config::ProxyConfig;
use crate::error::{GitupError, Result};
use crate::transport::Connection;

const SERVICE: &str = "git-upload-pack";

pub struct Client {
    conn: Connection,
    repository_path: String,
}

/// What the caller wants to fetch, resolved from the ref advertisement.
pub enum WantSelection<'a> {
    Explicit(&'a str),
    Tag(&'a str),
    Branch(&'a str),
}

pub enum FetchKind<'a> {
    Clone { want: &'a str },
    Pull { want: &'a str, have: &'a str },
    Repair { wants: &'a [String] },
}

impl Client {
    pub fn connect(host: &str, port: u16, repository_path: &str, proxy: Option<&ProxyConfig>, verbose: bool) -> Result<Client> {
        let conn = Connection::connect(host, port, proxy, verbose)?;
        Ok(Client {
            conn,
            repository_path: repository_path.trim_end_matches('/').to_string(),
        })
    }

    /// Discovery: GET info/refs?service=git-upload-pack, requiring `version
    /// 2` in the advertisement.
    pub fn discover(&mut self) -> Result<()> {
        let request = format!(
            "GET {path}/info/refs?service={SERVICE} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Git-Protocol: version=2\r\n\
             Accept: */*\r\n\
             Connection: close\r\n\r\n",
            path = self.repository_path,
            host = self.conn.host(),
        );
        let body = self.conn.exchange(request.as_bytes())?;
        let text = String::from_utf8_lossy(&body);
        if !text.contains("version 2") {
            return Err(GitupError::UnsupportedProtocol);
        }
        Ok(())
    }

    /// `command=ls-refs` over POST upload-pack; returns the raw ref lines
    /// (one `<hash> <refname> [attrs...]` string per advertised ref).
    pub fn ls_refs(&mut self) -> Result<Vec<String>> {
        let mut body = Vec::new();
        write_pkt_line(&mut body, "command=ls-refs\n");
        write_pkt_line(&mut body, "agent=gitup/1.0\n");
        write_delim(&mut body);
        write_pkt_line(&mut body, "peel\n");
        write_pkt_line(&mut body, "symrefs\n");
        write_pkt_line(&mut body, "ref-prefix HEAD\n");
        write_pkt_line(&mut body, "ref-prefix refs/heads/\n");
        write_pkt_line(&mut body, "ref-prefix refs/tags/\n");
        write_flush(&mut body);

        let response = self.post_upload_pack(&body)?;
        let lines = decode_pkt_lines(&response);
        Ok(lines
            .into_iter()
            .filter_map(|l| String::from_utf8(l).ok())
            .map(|l| l.trim_end_matches('\n').to_string())
            .collect())
    }

    /// Resolves a user selection against the advertised ref lines, applying
    /// the `quarterly` branch substitution and its one-shot previous-quarter
    /// retry.
    pub fn resolve_want(refs: &[String], selection: WantSelection<'_>) -> Result<(String, String)> {
        match selection {
            WantSelection::Explicit(hash) => Ok((hash.to_string(), "(detached)".to_string())),
            WantSelection::Tag(tag) => {
                let hash = find_ref(refs, "refs/tags/", tag)
                    .ok_or_else(|| GitupError::RefNotFound(format!("tag '{tag}' not found")))?;
                Ok((hash, tag.to_string()))
            }
            WantSelection::Branch(branch) if branch == "quarterly" => resolve_quarterly(refs),
            WantSelection::Branch(branch) => {
                let hash = find_ref(refs, "refs/heads/", branch)
                    .ok_or_else(|| GitupError::RefNotFound(format!("branch '{branch}' not found")))?;
                Ok((hash, branch.to_string()))
            }
        }
    }

    /// Builds and sends the clone/pull/repair fetch command, returning the
    /// assembled packfile bytes (pre-trailer-check; the pack parser validates
    /// the trailer as part of parsing the pack).
    pub fn fetch(&mut self, kind: FetchKind<'_>) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        write_pkt_line(&mut body, "command=fetch\n");
        write_pkt_line(&mut body, "agent=gitup/1.0\n");
        write_delim(&mut body);

        match kind {
            FetchKind::Clone { want } => {
                write_pkt_line(&mut body, "no-progress\n");
                write_pkt_line(&mut body, "ofs-delta\n");
                write_pkt_line(&mut body, &format!("shallow {want}\n"));
                write_pkt_line(&mut body, &format!("want {want}\n"));
            }
            FetchKind::Pull { want, have } => {
                write_pkt_line(&mut body, "thin-pack\n");
                write_pkt_line(&mut body, "no-progress\n");
                write_pkt_line(&mut body, "ofs-delta\n");
                write_pkt_line(&mut body, &format!("shallow {want}\n"));
                write_pkt_line(&mut body, &format!("shallow {have}\n"));
                write_pkt_line(&mut body, "deepen 1\n");
                write_pkt_line(&mut body, &format!("want {want}\n"));
                write_pkt_line(&mut body, &format!("have {have}\n"));
            }
            FetchKind::Repair { wants } => {
                write_pkt_line(&mut body, "thin-pack\n");
                write_pkt_line(&mut body, "no-progress\n");
                write_pkt_line(&mut body, "ofs-delta\n");
                for w in wants {
                    write_pkt_line(&mut body, &format!("want {w}\n"));
                }
                write_pkt_line(&mut body, "deepen 1\n");
            }
        }
        write_pkt_line(&mut body, "done\n");
        write_flush(&mut body);

        if body.len() > 3200 * 1024 {
            return Err(GitupError::TooManyRepairs);
        }

        let response = self.post_upload_pack(&body)?;
        extract_pack_from_response(&response)
    }

    fn post_upload_pack(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        let mut request = format!(
            "POST {path}/{SERVICE} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Content-Type: application/x-git-upload-pack-request\r\n\
             Accept: application/x-git-upload-pack-result\r\n\
             Git-Protocol: version=2\r\n\
             Content-Length: {len}\r\n\
             Connection: close\r\n\r\n",
            path = self.repository_path,
            host = self.conn.host(),
            len = body.len(),
        )
        .into_bytes();
        request.extend_from_slice(body);
        self.conn.exchange(&request)
    }
}

fn find_ref(refs: &[String], prefix: &str, name: &str) -> Option<String> {
    let needle = format!(" {prefix}{name}");
    for line in refs {
        if let Some(pos) = line.find(&needle) {
            let after = pos + needle.len();
            let tail_ok = line[after..].is_empty() || line.as_bytes().get(after) == Some(&b' ');
            if !tail_ok {
                continue;
            }
            if let Some(peel_pos) = line.find("peeled:") {
                let start = peel_pos + "peeled:".len();
                if let Some(hash) = line.get(start..start + 40) {
                    return Some(hash.to_string());
                }
            }
            if let Some(hash) = line.get(0..40) {
                return Some(hash.to_string());
            }
        }
    }
    None
}

fn resolve_quarterly(refs: &[String]) -> Result<(String, String)> {
    let now = chrono::Local::now();
    let (mut year, mut quarter) = (now.year(), (now.month() as i32 - 1) / 3 + 1);

    for _ in 0..2 {
        let branch = format!("{year}Q{quarter}");
        if let Some(hash) = find_ref(refs, "refs/heads/", &branch) {
            return Ok((hash, branch));
        }
        quarter -= 1;
        if quarter == 0 {
            quarter = 4;
            year -= 1;
        }
    }

    Err(GitupError::RefNotFound("quarterly branch not found in either of the last two quarters".into()))
}

fn write_pkt_line(out: &mut Vec<u8>, data: &str) {
    let len = data.len() + 4;
    out.extend_from_slice(format!("{len:04x}").as_bytes());
    out.extend_from_slice(data.as_bytes());
}

fn write_flush(out: &mut Vec<u8>) {
    out.extend_from_slice(b"0000");
}

fn write_delim(out: &mut Vec<u8>) {
    out.extend_from_slice(b"0001");
}

/// Decodes a pkt-line stream into its payloads, skipping flush/delim
/// markers.
fn decode_pkt_lines(data: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut cursor = 0;
    while cursor + 4 <= data.len() {
        let len_str = std::str::from_utf8(&data[cursor..cursor + 4]).unwrap_or("0000");
        let len = usize::from_str_radix(len_str, 16).unwrap_or(0);
        if len == 0 || len == 1 {
            cursor += 4;
            continue;
        }
        if cursor + len > data.len() {
            break;
        }
        out.push(data[cursor + 4..cursor + len].to_vec());
        cursor += len;
    }
    out
}

/// Assembles the packfile out of the side-band-framed POST response: find
/// `PACK`, back up 5 bytes for the pkt-line length+band marker that
/// precedes it, then walk pkt-lines concatenating band-1 payloads.
fn extract_pack_from_response(body: &[u8]) -> Result<Vec<u8>> {
    let pack_idx = body
        .windows(4)
        .position(|w| w == b"PACK")
        .ok_or_else(|| GitupError::TransportFailure("PACK magic not found in fetch response".into()))?;
    if pack_idx < 5 {
        return Err(GitupError::TransportFailure("malformed band marker preceding PACK".into()));
    }

    let mut cursor = pack_idx - 5;
    let mut pack = Vec::new();

    while cursor + 4 <= body.len() {
        let len_str = std::str::from_utf8(&body[cursor..cursor + 4])
            .map_err(|_| GitupError::TransportFailure("invalid pkt-line length".into()))?;
        let len = usize::from_str_radix(len_str, 16)
            .map_err(|_| GitupError::TransportFailure("invalid pkt-line length".into()))?;
        if len == 0 {
            break;
        }
        if cursor + len > body.len() {
            return Err(GitupError::TransportFailure("truncated pkt-line in fetch response".into()));
        }
        let band = body[cursor + 4];
        let data = &body[cursor + 5..cursor + len];
        match band {
            1 => pack.extend_from_slice(data),
            2 => log::info!("remote: {}", String::from_utf8_lossy(data).trim_end()),
            _ => log::warn!("remote error: {}", String::from_utf8_lossy(data).trim_end()),
        }
        cursor += len;
    }

    Ok(pack)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkt_line_round_trips() {
        let mut buf = Vec::new();
        write_pkt_line(&mut buf, "command=ls-refs\n");
        write_flush(&mut buf);
        let decoded = decode_pkt_lines(&buf);
        assert_eq!(decoded, vec![b"command=ls-refs\n".to_vec()]);
    }

    #[test]
    fn find_ref_prefers_peeled_annotation() {
        let refs = vec![
            "6c073b08f7987018cbb2cb9a5747c84913b36081 refs/tags/1.0.0 peeled:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
        ];
        let hash = find_ref(&refs, "refs/tags/", "1.0.0").unwrap();
        assert_eq!(hash, "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    }

    #[test]
    fn find_ref_falls_back_to_leading_hash() {
        let refs = vec!["6c073b08f7987018cbb2cb9a5747c84913b36081 refs/tags/1.0.0".to_string()];
        let hash = find_ref(&refs, "refs/tags/", "1.0.0").unwrap();
        assert_eq!(hash, "6c073b08f7987018cbb2cb9a5747c84913b36081");
    }

    #[test]
    fn find_ref_returns_none_for_unknown_name() {
        let refs = vec!["6c073b08f7987018cbb2cb9a5747c84913b36081 refs/heads/main".to_string()];
        assert!(find_ref(&refs, "refs/heads/", "other").is_none());
    }

    #[test]
    fn extract_pack_strips_band_marker_and_concatenates() {
        let mut body = Vec::new();
        let mut payload = Vec::new();
        payload.push(1u8); // band 1
        payload.extend_from_slice(b"PACK\x00\x00\x00\x02\x00\x00\x00\x00");
        let len = payload.len() + 4;
        body.extend_from_slice(format!("{len:04x}").as_bytes());
        body.extend_from_slice(&payload);
        body.extend_from_slice(b"0000");

        let pack = extract_pack_from_response(&body).unwrap();
        assert!(pack.starts_with(b"PACK"));
    }
}
