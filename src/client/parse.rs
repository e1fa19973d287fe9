// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing of RTSP responses, `Transport`/`Session` header fields, and the
//! subset of SDP ([RFC 4566](https://datatracker.ietf.org/doc/html/rfc4566))
//! this crate consumes.

use bytes::Bytes;
use log::{debug, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::Error;

/// Responses with more header lines than this are assumed to be a desynced
/// or hostile stream.
const MAX_HEADER_LINES: usize = 50;

/// SDP bodies are a few hundred bytes; anything near this is a desynced
/// stream, not a description.
const MAX_BODY_LEN: usize = 1 << 20;

/// A parsed RTSP response. `status == 0` means the server sent only a blank
/// line; `PLAY` treats that as success, everything else as a failure.
#[derive(Debug)]
pub(crate) struct Response {
    pub(crate) status: u16,
    pub(crate) reason: String,
    headers: Vec<(String, String)>,
    pub(crate) body: Bytes,
}

impl Response {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Splits the string on the first occurrence of the specified delimiter and
/// returns prefix before delimiter and suffix after delimiter.
pub(crate) fn split_once(s: &str, delimiter: char) -> Option<(&str, &str)> {
    s.find(delimiter).map(|p| (&s[0..p], &s[p + 1..]))
}

/// Reads one CRLF-framed RTSP response: a status line, up to
/// [`MAX_HEADER_LINES`] header lines, a blank line, then exactly
/// `Content-Length` bytes of body. The caller bounds the whole read with a
/// timeout.
pub(crate) async fn read_response<R: AsyncBufRead + Unpin>(
    r: &mut R,
    method: &'static str,
) -> Result<Response, Error> {
    let mut line = String::new();
    if r.read_line(&mut line).await.map_err(|source| Error::Io {
        context: "reading response status line",
        source,
    })? == 0
    {
        return Err(Error::ConnectionClosed);
    }
    let status_line = line.trim_end();
    if status_line.is_empty() {
        debug!("{}: server sent an empty response", method);
        return Ok(Response {
            status: 0,
            reason: String::new(),
            headers: Vec::new(),
            body: Bytes::new(),
        });
    }
    let (status, reason) = parse_status_line(status_line).ok_or_else(|| Error::Malformed {
        method,
        description: format!("bad status line {:?}", status_line),
    })?;
    let reason = reason.to_owned();

    let mut headers = Vec::new();
    loop {
        line.clear();
        if r.read_line(&mut line).await.map_err(|source| Error::Io {
            context: "reading response header",
            source,
        })? == 0
        {
            return Err(Error::ConnectionClosed);
        }
        let l = line.trim_end();
        if l.is_empty() {
            break;
        }
        if headers.len() == MAX_HEADER_LINES {
            return Err(Error::Malformed {
                method,
                description: format!("more than {} header lines", MAX_HEADER_LINES),
            });
        }
        match split_once(l, ':') {
            Some((name, value)) => headers.push((name.trim().to_owned(), value.trim().to_owned())),
            None => debug!("{}: ignoring header line with no colon: {:?}", method, l),
        }
    }

    let content_length = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_LEN {
        return Err(Error::Malformed {
            method,
            description: format!("implausible Content-Length {}", content_length),
        });
    }
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        r.read_exact(&mut body).await.map_err(|source| Error::Io {
            context: "reading response body",
            source,
        })?;
    }
    Ok(Response {
        status,
        reason,
        headers,
        body: Bytes::from(body),
    })
}

fn parse_status_line(line: &str) -> Option<(u16, &str)> {
    let (proto, rest) = split_once(line, ' ')?;
    if !proto.starts_with("RTSP/") {
        return None;
    }
    let (code, reason) = match split_once(rest, ' ') {
        Some((c, r)) => (c, r),
        None => (rest, ""),
    };
    Some((code.parse::<u16>().ok()?, reason))
}

/// The parameters this crate consumes from a `Transport` response header.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct TransportParams {
    pub(crate) interleaved: Option<(u8, u8)>,
    pub(crate) client_port: Option<(u16, u16)>,
    pub(crate) server_port: Option<(u16, u16)>,
    pub(crate) ssrc: Option<u32>,
}

pub(crate) fn parse_transport(value: &str) -> TransportParams {
    let mut t = TransportParams::default();
    for part in value.split(';') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("interleaved=") {
            t.interleaved = parse_pair(v);
        } else if let Some(v) = part.strip_prefix("client_port=") {
            t.client_port = parse_pair(v);
        } else if let Some(v) = part.strip_prefix("server_port=") {
            t.server_port = parse_pair(v);
        } else if let Some(v) = part.strip_prefix("ssrc=") {
            t.ssrc = u32::from_str_radix(v, 16).ok();
        }
    }
    t
}

/// Parses `n-m` (or a bare `n`, in which case `m = n + 1`).
fn parse_pair<T: Copy + std::str::FromStr + std::ops::Add<Output = T> + From<u8>>(
    v: &str,
) -> Option<(T, T)> {
    let mut it = v.splitn(2, '-');
    let first = it.next()?.trim().parse::<T>().ok()?;
    let second = match it.next() {
        Some(s) => s.trim().parse::<T>().ok()?,
        None => first + T::from(1u8),
    };
    Some((first, second))
}

/// Parses a `Session` response header into the id (with any `;timeout=`
/// suffix stripped) and the advertised timeout.
pub(crate) fn parse_session(value: &str) -> (String, Option<std::time::Duration>) {
    let mut parts = value.split(';');
    let id = parts.next().unwrap_or("").trim().to_owned();
    let mut timeout = None;
    for part in parts {
        if let Some(v) = part.trim().strip_prefix("timeout=") {
            if let Ok(secs) = v.parse::<u64>() {
                timeout = Some(std::time::Duration::from_secs(secs));
            }
        }
    }
    (id, timeout)
}

/// One `m=` section of the SDP.
#[derive(Clone, Debug)]
pub struct MediaSection {
    pub kind: String,
    pub payload_type: Option<u8>,
    pub control: Option<String>,
}

/// What `DESCRIBE` yielded, reduced to what the pipeline needs.
#[derive(Clone)]
pub struct MediaInfo {
    /// The video section's `a=control` value, defaulting to `*`.
    pub video_control: String,

    /// The video section's RTP payload type.
    pub video_payload_type: u8,

    /// From the video `a=rtpmap`, e.g. `H264`.
    pub encoding_name: Option<String>,

    /// From the video `a=rtpmap`, e.g. 90000.
    pub clock_rate: Option<u32>,

    /// Out-of-band SPS NAL from `sprop-parameter-sets`, if present.
    pub sps: Option<Bytes>,

    /// Out-of-band PPS NAL from `sprop-parameter-sets`, if present.
    pub pps: Option<Bytes>,

    /// All media sections, in SDP order.
    pub media: Vec<MediaSection>,
}

impl std::fmt::Debug for MediaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use pretty_hex::PrettyHex;
        f.debug_struct("MediaInfo")
            .field("video_control", &self.video_control)
            .field("video_payload_type", &self.video_payload_type)
            .field("encoding_name", &self.encoding_name)
            .field("clock_rate", &self.clock_rate)
            .field("sps", &self.sps.as_ref().map(|s| s.hex_dump()))
            .field("pps", &self.pps.as_ref().map(|p| p.hex_dump()))
            .field("media", &self.media)
            .finish()
    }
}

/// Parses a `DESCRIBE` body into a [`MediaInfo`].
///
/// Only the first video section is interpreted beyond `m=`/`a=control`; an
/// absent video `a=control` defaults to `*` (meaning the original request
/// URL per [RFC 2326 appendix C.1.1](https://datatracker.ietf.org/doc/html/rfc2326#appendix-C.1.1)).
pub(crate) fn parse_sdp(body: &[u8]) -> Result<MediaInfo, Error> {
    if body.is_empty() {
        return Err(Error::Sdp("empty DESCRIBE body".to_owned()));
    }
    let mut cursor = std::io::Cursor::new(body);
    let sdp = sdp::session_description::SessionDescription::unmarshal(&mut cursor)
        .map_err(|e| Error::Sdp(e.to_string()))?;

    let mut media = Vec::with_capacity(sdp.media_descriptions.len());
    let mut video: Option<(String, u8, Option<String>, Option<u32>, Option<Bytes>, Option<Bytes>)> =
        None;
    for m in &sdp.media_descriptions {
        let kind = m.media_name.media.clone();
        let payload_type_str = m.media_name.formats.first();
        let payload_type = payload_type_str.and_then(|f| f.parse::<u8>().ok());
        let mut control = None;
        let mut rtpmap = None;
        let mut fmtp = None;
        for a in &m.attributes {
            if a.key == "control" {
                control = a.value.clone();
            } else if a.key == "rtpmap" {
                // rtpmap-value = payload-type SP encoding-name "/" clock-rate
                if let (Some(v), Some(pt)) = (a.value.as_ref(), payload_type_str) {
                    if let Some((rtpmap_pt, rest)) = split_once(v, ' ') {
                        if rtpmap_pt == pt.as_str() {
                            rtpmap = Some(rest.to_owned());
                        }
                    }
                }
            } else if a.key == "fmtp" {
                if let (Some(v), Some(pt)) = (a.value.as_ref(), payload_type_str) {
                    if let Some((fmtp_pt, rest)) = split_once(v, ' ') {
                        if fmtp_pt == pt.as_str() {
                            fmtp = Some(rest.to_owned());
                        }
                    }
                }
            }
        }
        if video.is_none() && kind == "video" {
            let payload_type = payload_type.ok_or_else(|| {
                Error::Sdp("video media section has no RTP payload type".to_owned())
            })?;
            let (mut encoding_name, mut clock_rate) = (None, None);
            if let Some(r) = rtpmap.as_deref() {
                let (name, rest) = match split_once(r, '/') {
                    Some((n, r)) => (n, Some(r)),
                    None => (r, None),
                };
                encoding_name = Some(name.to_owned());
                clock_rate = rest
                    .map(|r| match split_once(r, '/') {
                        Some((c, _)) => c,
                        None => r,
                    })
                    .and_then(|c| c.parse::<u32>().ok());
                if encoding_name.as_deref() == Some("H264") && clock_rate != Some(90_000) {
                    warn!("H264 rtpmap advertises clock rate {:?}, expected 90000", clock_rate);
                }
            }
            let (sps, pps) = match fmtp.as_deref().map(parse_sprop_parameter_sets) {
                Some((s, p)) => (s, p),
                None => (None, None),
            };
            video = Some((
                control.clone().unwrap_or_else(|| "*".to_owned()),
                payload_type,
                encoding_name,
                clock_rate,
                sps,
                pps,
            ));
        }
        media.push(MediaSection {
            kind,
            payload_type,
            control,
        });
    }

    let (video_control, video_payload_type, encoding_name, clock_rate, sps, pps) =
        video.ok_or_else(|| Error::Sdp("no video media section".to_owned()))?;
    Ok(MediaInfo {
        video_control,
        video_payload_type,
        encoding_name,
        clock_rate,
        sps,
        pps,
        media,
    })
}

/// Extracts the SPS and PPS NALs from an H.264 `fmtp` attribute's
/// `sprop-parameter-sets`, tolerating the stray trailing Annex-B start code
/// some cameras append.
fn parse_sprop_parameter_sets(fmtp: &str) -> (Option<Bytes>, Option<Bytes>) {
    let mut sps = None;
    let mut pps = None;
    for param in fmtp.split(';') {
        let (key, value) = match split_once(param.trim(), '=') {
            Some(kv) => kv,
            None => continue,
        };
        if key != "sprop-parameter-sets" {
            continue;
        }
        for encoded in value.split(',') {
            let nal = match base64::decode(encoded) {
                Ok(n) => n,
                Err(_) => {
                    debug!("sprop-parameter-sets NAL has invalid base64; ignoring");
                    continue;
                }
            };
            let nal = nal
                .strip_suffix(b"\x00\x00\x00\x01")
                .map(|n| n.to_vec())
                .unwrap_or(nal);
            match nal.first().map(|h| h & 0x1f) {
                Some(7) => sps = Some(Bytes::from(nal)),
                Some(8) => pps = Some(Bytes::from(nal)),
                _ => debug!("unexpected NAL in sprop-parameter-sets; ignoring"),
            }
        }
    }
    (sps, pps)
}

/// Builds the absolute `SETUP` URL from a control attribute.
///
/// *   an absolute `rtsp://` control is used as-is;
/// *   `*` means the original request URL;
/// *   an absolute path is appended to (`Content-Base` or
///     `rtsp://host:port`) with the base's trailing `/` stripped;
/// *   anything else is joined to (`Content-Base` or the request URL) with
///     a single `/` between them.
pub(crate) fn setup_url(rtsp_url: &str, base: Option<&str>, track: &str) -> String {
    if track.starts_with("rtsp://") {
        return track.to_owned();
    }
    if track == "*" {
        return rtsp_url.to_owned();
    }
    if let Some(path) = track.strip_prefix('/') {
        let base = match base {
            Some(b) => b.trim_end_matches('/').to_owned(),
            None => host_base(rtsp_url),
        };
        return format!("{}/{}", base, path);
    }
    let base = base.unwrap_or(rtsp_url).trim_end_matches('/');
    format!("{}/{}", base, track)
}

/// `rtsp://host:port` for the given request URL, without any path.
fn host_base(rtsp_url: &str) -> String {
    match url::Url::parse(rtsp_url) {
        Ok(u) => {
            let host = u.host_str().unwrap_or("");
            let port = u.port().unwrap_or(super::DEFAULT_RTSP_PORT);
            format!("rtsp://{}:{}", host, port)
        }
        Err(_) => rtsp_url.trim_end_matches('/').to_owned(),
    }
}
