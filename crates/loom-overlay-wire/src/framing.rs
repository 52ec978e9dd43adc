// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Length-prefixed framing for base messages carried over TCP.

use crate::error::{Result, WireError, MAX_FRAME_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Looks like a TLS application-data record header.
pub const FRAME_TAG: [u8; 3] = [0x17, 0x03, 0x03];
pub const FRAME_HEADER_LEN: usize = 5;

pub fn encode_frame_header(payload_len: usize) -> Result<[u8; FRAME_HEADER_LEN]> {
	if payload_len > MAX_FRAME_SIZE {
		return Err(WireError::FrameTooLarge(payload_len, MAX_FRAME_SIZE));
	}
	let len = (payload_len as u16).to_be_bytes();
	Ok([FRAME_TAG[0], FRAME_TAG[1], FRAME_TAG[2], len[0], len[1]])
}

pub fn decode_frame_header(header: &[u8; FRAME_HEADER_LEN]) -> Result<usize> {
	let tag = [header[0], header[1], header[2]];
	if tag != FRAME_TAG {
		return Err(WireError::InvalidFrameTag(tag));
	}
	Ok(u16::from_be_bytes([header[3], header[4]]) as usize)
}

pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
	let header = encode_frame_header(payload.len())?;
	let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
	buf.extend_from_slice(&header);
	buf.extend_from_slice(payload);
	Ok(buf)
}

/// Reads one frame, waiting for the full payload. A clean EOF before the
/// header is reported as [`WireError::ConnectionClosed`].
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>> {
	let mut header = [0u8; FRAME_HEADER_LEN];
	match stream.read_exact(&mut header).await {
		Ok(_) => {}
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
			return Err(WireError::ConnectionClosed)
		}
		Err(e) => return Err(WireError::Io(e)),
	}

	let payload_len = decode_frame_header(&header)?;
	let mut payload = vec![0u8; payload_len];
	if payload_len > 0 {
		stream.read_exact(&mut payload).await?;
	}
	Ok(payload)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, payload: &[u8]) -> Result<()> {
	let frame = encode_frame(payload)?;
	stream.write_all(&frame).await?;
	Ok(())
}
