use crate::{Asset, AssetClass, AssetError};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use byte_ranges::Span;
use bytes::{BufMut, Bytes, BytesMut};

/// Content type of JPEG-2000 textures.
pub const J2C_CONTENT_TYPE: &str = "image/x-j2c";
/// Content type of JPEG textures.
pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";
/// Content type of textures which are not otherwise recognized.
pub const TGA_CONTENT_TYPE: &str = "image/x-tga";
/// Content type of mesh assets.
pub const MESH_CONTENT_TYPE: &str = "application/vnd.ll.mesh";

const JP2_SIGNATURE: &[u8] = &[
    0x00, 0x00, 0x00, 0x0C, 0x6A, 0x50, 0x20, 0x20, 0x0D, 0x0A, 0x87, 0x0A,
];
const J2K_SIGNATURE: &[u8] = &[0xFF, 0x4F, 0xFF, 0x51];
const JPEG_SIGNATURE: &[u8] = &[0xFF, 0xD8, 0xFF];

/// Determine the content type of an asset of `class` having `data`.
/// Textures are sniffed from their leading bytes.
pub fn content_type(class: AssetClass, data: &[u8]) -> &'static str {
    match class {
        AssetClass::Mesh => MESH_CONTENT_TYPE,
        AssetClass::Texture if data.starts_with(JP2_SIGNATURE) => J2C_CONTENT_TYPE,
        AssetClass::Texture if data.starts_with(J2K_SIGNATURE) => J2C_CONTENT_TYPE,
        AssetClass::Texture if data.starts_with(JPEG_SIGNATURE) => JPEG_CONTENT_TYPE,
        AssetClass::Texture => TGA_CONTENT_TYPE,
    }
}

/// Assembled is a response to an asset request, which is either the full
/// asset, a single range of it, or a multipart body of several ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub status: StatusCode,
    pub content_type: String,
    pub content_range: Option<String>,
    pub body: Bytes,
}

/// Assemble the response serving `spans` of `asset`, or all of it if
/// `spans` is None. `spans` must be ascending, disjoint, and within the asset.
pub fn assemble(asset: &Asset, class: AssetClass, spans: Option<&[Span]>) -> Assembled {
    let boundary = uuid::Uuid::new_v4().simple().to_string();
    assemble_with_boundary(asset, class, spans, &boundary)
}

/// Assemble as `assemble` does, delimiting multipart bodies with `boundary`.
pub fn assemble_with_boundary(
    asset: &Asset,
    class: AssetClass,
    spans: Option<&[Span]>,
    boundary: &str,
) -> Assembled {
    let length = asset.data.len() as u64;
    let part_type = content_type(class, &asset.data);

    match spans {
        None | Some([]) => Assembled {
            status: StatusCode::OK,
            content_type: part_type.to_string(),
            content_range: None,
            body: asset.data.clone(),
        },
        Some([span]) => Assembled {
            status: StatusCode::PARTIAL_CONTENT,
            content_type: part_type.to_string(),
            content_range: Some(span.content_range(length)),
            body: asset.data.slice(span.to_range()),
        },
        Some(spans) => {
            let mut body = BytesMut::new();

            for span in spans {
                body.put_slice(format!("--{boundary}\r\n").as_bytes());
                body.put_slice(format!("Content-Type: {part_type}\r\n").as_bytes());
                body.put_slice(
                    format!("Content-Range: {}\r\n\r\n", span.content_range(length)).as_bytes(),
                );
                body.put_slice(&asset.data[span.to_range()]);
                body.put_slice(b"\r\n");
            }
            body.put_slice(format!("--{boundary}--\r\n").as_bytes());

            Assembled {
                status: StatusCode::PARTIAL_CONTENT,
                content_type: format!("multipart/byteranges; boundary={boundary}"),
                content_range: None,
                body: body.freeze(),
            }
        }
    }
}

/// Response to a request having a Range which can't be served from
/// content of `length` bytes.
pub fn unsatisfiable(err: AssetError, length: u64) -> Response {
    let mut response = err.into_response();
    if let Ok(value) = HeaderValue::from_str(&format!("bytes */{length}")) {
        response.headers_mut().insert(header::CONTENT_RANGE, value);
    }
    response
}

impl IntoResponse for Assembled {
    fn into_response(self) -> Response {
        let Assembled {
            status,
            content_type,
            content_range,
            body,
        } = self;

        let content_length = body.len();
        let mut response = (status, body).into_response();
        let headers = response.headers_mut();

        match HeaderValue::from_str(&content_type) {
            Ok(value) => {
                headers.insert(header::CONTENT_TYPE, value);
            }
            Err(err) => tracing::error!(?err, %content_type, "invalid content type"),
        }
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));

        if let Some(content_range) = content_range {
            match HeaderValue::from_str(&content_range) {
                Ok(value) => {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                Err(err) => tracing::error!(?err, %content_range, "invalid content range"),
            }
        }
        response
    }
}
