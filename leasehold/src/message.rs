//! Lease protocol wire format.
//!
//! Little-endian fixed header followed by a flat body. The header field order
//! is interop-significant and must not change within a major version.

use crate::{
    endpoint::{ListenEndpoint, ENDPOINT_ADDRESS_MAX},
    identifier::{IdentifierSet, LeaseRelationshipIdentifier, PendingLists},
    time::{Instance, DURATION_MAX},
    Error, Result,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const LIST_COUNT: usize = 9;
const DESCRIPTOR_COUNT: usize = LIST_COUNT + 2;
const DESCRIPTOR_SIZE: usize = 12;
const FIXED_FIELDS_SIZE: usize = 1 + 1 + 4 + 4 + 8 + 4 + 8 + 8 + 4 + 8 + 4 + 4 + 1;
pub const HEADER_SIZE: usize = FIXED_FIELDS_SIZE + DESCRIPTOR_COUNT * DESCRIPTOR_SIZE;
pub const EXTENSION_SIZE: usize = 8;

/// Longest application identifier accepted on the wire.
pub const APP_IDENTIFIER_MAX: usize = 260;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    LeaseRequest = 0,
    LeaseResponse = 1,
    PingRequest = 2,
    PingResponse = 3,
    ForwardRequest = 4,
    ForwardResponse = 5,
    RelayRequest = 6,
    RelayResponse = 7,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => MessageType::LeaseRequest,
            1 => MessageType::LeaseResponse,
            2 => MessageType::PingRequest,
            3 => MessageType::PingResponse,
            4 => MessageType::ForwardRequest,
            5 => MessageType::ForwardResponse,
            6 => MessageType::RelayRequest,
            7 => MessageType::RelayResponse,
            _ => return None,
        })
    }

    /// A request as seen by the final receiver.
    pub fn is_received_request(self) -> bool {
        matches!(self, MessageType::LeaseRequest | MessageType::RelayRequest)
    }

    /// A response as seen by the final receiver.
    pub fn is_received_response(self) -> bool {
        matches!(self, MessageType::LeaseResponse | MessageType::RelayResponse)
    }

    pub fn is_ping(self) -> bool {
        matches!(self, MessageType::PingRequest | MessageType::PingResponse)
    }

    pub fn is_forward(self) -> bool {
        matches!(self, MessageType::ForwardRequest | MessageType::ForwardResponse)
    }

    pub fn is_relay(self) -> bool {
        matches!(self, MessageType::RelayRequest | MessageType::RelayResponse)
    }
}

/// `{count, start_offset, size}` locating one section of the body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BodyDescriptor {
    pub count: u32,
    pub start_offset: u32,
    pub size: u32,
}

impl BodyDescriptor {
    fn is_within(&self, header_size: usize, message_size: usize) -> bool {
        if self.size == 0 {
            return self.count == 0;
        }
        let start = self.start_offset as usize;
        let end = start.checked_add(self.size as usize);
        start >= header_size && end.is_some_and(|end| end <= message_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseMessage {
    pub major_version: u8,
    pub minor_version: u8,
    pub message_id: i64,
    pub message_type: MessageType,
    pub lease_instance: Instance,
    pub remote_lease_agent_instance: Instance,
    pub duration: i32,
    pub expiration: i64,
    pub lease_suspend_duration: i32,
    pub arbitration_duration: i32,
    pub is_two_way_termination: bool,
    pub lists: PendingLists,
    /// Listen endpoint of the agent that put this message on the wire.
    pub sender: ListenEndpoint,
    /// Far end of a forward/relay hop.
    pub lease_endpoint: Option<ListenEndpoint>,
    /// The receiver's agent instance as known by the sender, zero when unknown.
    pub msg_lease_agent_instance: Instance,
}

impl LeaseMessage {
    pub fn is_termination(&self) -> bool {
        self.duration == DURATION_MAX
    }

    pub fn encode(&self) -> Bytes {
        let list_sizes: Vec<usize> = self.lists.iter().map(list_size).collect();
        let sender_size = endpoint_size(&self.sender);
        let lease_size = self.lease_endpoint.as_ref().map_or(0, endpoint_size);
        let body_size = list_sizes.iter().sum::<usize>() + sender_size + lease_size + EXTENSION_SIZE;
        let message_size = HEADER_SIZE + body_size;

        let mut buf = BytesMut::with_capacity(message_size);
        buf.put_u8(self.major_version);
        buf.put_u8(self.minor_version);
        buf.put_u32_le(wire_u32(HEADER_SIZE));
        buf.put_u32_le(wire_u32(message_size));
        buf.put_i64_le(self.message_id);
        buf.put_u32_le(self.message_type as u32);
        buf.put_i64_le(self.lease_instance.0);
        buf.put_i64_le(self.remote_lease_agent_instance.0);
        buf.put_i32_le(self.duration);
        buf.put_i64_le(self.expiration);
        buf.put_i32_le(self.lease_suspend_duration);
        buf.put_i32_le(self.arbitration_duration);
        buf.put_u8(u8::from(self.is_two_way_termination));

        let mut offset = HEADER_SIZE;
        for (list, size) in self.lists.iter().zip(&list_sizes) {
            put_descriptor(&mut buf, list.len(), offset, *size);
            offset += size;
        }
        put_descriptor(&mut buf, 1, offset, sender_size);
        offset += sender_size;
        if self.lease_endpoint.is_some() {
            put_descriptor(&mut buf, 1, offset, lease_size);
        } else {
            put_descriptor(&mut buf, 0, 0, 0);
        }
        debug_assert_eq!(buf.len(), HEADER_SIZE);

        for list in self.lists.iter() {
            for id in list {
                put_string(&mut buf, &id.local_app);
                put_string(&mut buf, &id.remote_app);
            }
        }
        put_endpoint(&mut buf, &self.sender);
        if let Some(endpoint) = &self.lease_endpoint {
            put_endpoint(&mut buf, endpoint);
        }
        buf.put_i64_le(self.msg_lease_agent_instance.0);
        debug_assert_eq!(buf.len(), message_size);
        buf.freeze()
    }

    /// Validates and decodes a complete message.
    pub fn decode(buffer: &[u8]) -> Result<LeaseMessage> {
        if buffer.len() < HEADER_SIZE {
            return Err(malformed(format!("buffer of {} bytes is shorter than the header", buffer.len())));
        }
        let mut header = &buffer[..HEADER_SIZE];
        let major_version = header.get_u8();
        let minor_version = header.get_u8();
        let header_size = header.get_u32_le() as usize;
        let message_size = header.get_u32_le() as usize;
        let message_id = header.get_i64_le();
        let raw_type = header.get_u32_le();
        let lease_instance = Instance(header.get_i64_le());
        let remote_lease_agent_instance = Instance(header.get_i64_le());
        let duration = header.get_i32_le();
        let expiration = header.get_i64_le();
        let lease_suspend_duration = header.get_i32_le();
        let arbitration_duration = header.get_i32_le();
        let is_two_way_termination = header.get_u8() != 0;
        let mut descriptors = [BodyDescriptor::default(); DESCRIPTOR_COUNT];
        for descriptor in &mut descriptors {
            descriptor.count = header.get_u32_le();
            descriptor.start_offset = header.get_u32_le();
            descriptor.size = header.get_u32_le();
        }

        if message_size != buffer.len() {
            return Err(malformed(format!(
                "message size {message_size} does not match buffer of {} bytes",
                buffer.len()
            )));
        }
        if header_size != HEADER_SIZE || header_size >= message_size {
            return Err(malformed(format!("invalid header size {header_size}")));
        }
        let message_type = MessageType::from_u32(raw_type)
            .ok_or_else(|| malformed(format!("unknown message type {raw_type}")))?;
        if !message_type.is_ping() {
            if duration <= 0 {
                return Err(malformed(format!("invalid duration {duration}")));
            }
            if lease_instance.0 <= 0 {
                return Err(malformed(format!("invalid lease instance {}", lease_instance.0)));
            }
        }
        if let Some(bad) = descriptors
            .iter()
            .position(|d| !d.is_within(header_size, message_size - EXTENSION_SIZE))
        {
            return Err(malformed(format!("descriptor {bad} points outside the body")));
        }

        let mut lists = PendingLists::default();
        for (list, descriptor) in lists.iter_mut().zip(&descriptors[..LIST_COUNT]) {
            *list = read_list(buffer, descriptor)?;
        }

        let sender_descriptor = descriptors[LIST_COUNT];
        if sender_descriptor.size == 0 {
            return Err(malformed("missing sender listen endpoint".to_string()));
        }
        let sender = read_endpoint(buffer, &sender_descriptor)?;
        let lease_descriptor = descriptors[LIST_COUNT + 1];
        let lease_endpoint = if lease_descriptor.size == 0 {
            None
        } else {
            Some(read_endpoint(buffer, &lease_descriptor)?)
        };
        if (message_type.is_forward() || message_type.is_relay()) && lease_endpoint.is_none() {
            return Err(malformed(format!("{message_type:?} without lease endpoint")));
        }

        let mut extension = &buffer[message_size - EXTENSION_SIZE..];
        let msg_lease_agent_instance = Instance(extension.get_i64_le());

        Ok(LeaseMessage {
            major_version,
            minor_version,
            message_id,
            message_type,
            lease_instance,
            remote_lease_agent_instance,
            duration,
            expiration,
            lease_suspend_duration,
            arbitration_duration,
            is_two_way_termination,
            lists,
            sender,
            lease_endpoint,
            msg_lease_agent_instance,
        })
    }
}

/// Reads only the major/minor version bytes, before full validation.
pub fn peek_version(buffer: &[u8]) -> Option<(u8, u8)> {
    match buffer {
        [major, minor, ..] => Some((*major, *minor)),
        _ => None,
    }
}

fn malformed(reason: String) -> Error {
    Error::MalformedMessage(reason)
}

fn wire_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn list_size(list: &IdentifierSet) -> usize {
    list.iter()
        .map(|id| 8 + id.local_app.len() + id.remote_app.len())
        .sum()
}

fn endpoint_size(endpoint: &ListenEndpoint) -> usize {
    4 + endpoint.address.len() + 2
}

fn put_descriptor(buf: &mut BytesMut, count: usize, offset: usize, size: usize) {
    buf.put_u32_le(wire_u32(count));
    buf.put_u32_le(wire_u32(offset));
    buf.put_u32_le(wire_u32(size));
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(wire_u32(value.len()));
    buf.put_slice(value.as_bytes());
}

fn put_endpoint(buf: &mut BytesMut, endpoint: &ListenEndpoint) {
    put_string(buf, &endpoint.address);
    buf.put_u16_le(endpoint.port);
}

fn section<'a>(buffer: &'a [u8], descriptor: &BodyDescriptor) -> &'a [u8] {
    let start = descriptor.start_offset as usize;
    &buffer[start..start + descriptor.size as usize]
}

fn get_string(section: &mut &[u8], max: usize) -> Result<String> {
    if section.remaining() < 4 {
        return Err(malformed("truncated string length".to_string()));
    }
    let len = section.get_u32_le() as usize;
    if len == 0 || len > max || len > section.remaining() {
        return Err(malformed(format!("invalid string length {len}")));
    }
    let value = std::str::from_utf8(&section[..len])
        .map_err(|_| malformed("identifier is not valid utf-8".to_string()))?
        .to_string();
    section.advance(len);
    Ok(value)
}

fn read_list(buffer: &[u8], descriptor: &BodyDescriptor) -> Result<IdentifierSet> {
    let mut set = IdentifierSet::new();
    let mut bytes = section(buffer, descriptor);
    for _ in 0..descriptor.count {
        let local_app = get_string(&mut bytes, APP_IDENTIFIER_MAX)?;
        let remote_app = get_string(&mut bytes, APP_IDENTIFIER_MAX)?;
        set.insert(LeaseRelationshipIdentifier { local_app, remote_app });
    }
    if bytes.has_remaining() {
        return Err(malformed("trailing bytes after identifier list".to_string()));
    }
    Ok(set)
}

fn read_endpoint(buffer: &[u8], descriptor: &BodyDescriptor) -> Result<ListenEndpoint> {
    let mut bytes = section(buffer, descriptor);
    let address = get_string(&mut bytes, ENDPOINT_ADDRESS_MAX)?;
    if bytes.remaining() != 2 {
        return Err(malformed("invalid listen endpoint section".to_string()));
    }
    let endpoint = ListenEndpoint::new(address, bytes.get_u16_le());
    if !endpoint.is_valid() {
        return Err(malformed(format!("invalid listen endpoint {endpoint}")));
    }
    Ok(endpoint)
}
