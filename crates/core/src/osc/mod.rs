//! OSC datagram support on top of `rosc`.
//!
//! Outbound control messages carry exactly one `int32` argument. Inbound
//! decoding understands the single-argument parameter messages the host bus
//! sends under [`AVATAR_PARAMETER_PREFIX`], alone or inside bundles.

use rosc::{OscBundle, OscMessage, OscPacket, OscType};

use crate::{
    parameter::{ParameterUpdate, ParameterValue},
    HaptickleError, Result,
};

/// Address prefix of avatar parameter messages on the host bus.
pub const AVATAR_PARAMETER_PREFIX: &str = "/avatar/parameters/";

/// Quantizes a normalised intensity to the 0..=255 wire range.
pub fn quantize_intensity(intensity: f32) -> i32 {
    if !intensity.is_finite() {
        return 0;
    }
    (intensity.clamp(0.0, 1.0) * 255.0).round() as i32
}

/// Encodes `address` with a single big-endian `int32` argument.
pub fn encode_int_message(address: &str, value: i32) -> Result<Vec<u8>> {
    validate_address(address)?;

    let packet = OscPacket::Message(OscMessage {
        addr: address.to_string(),
        args: vec![OscType::Int(value)],
    });
    rosc::encoder::encode(&packet).map_err(codec_error)
}

/// Decodes every avatar parameter carried by a datagram.
///
/// A lone message that is not an avatar parameter is an error. Inside a
/// bundle such messages are skipped so one foreign entry does not drop the
/// rest.
pub fn decode_parameters(datagram: &[u8]) -> Result<Vec<ParameterUpdate>> {
    let (_, packet) = rosc::decoder::decode_udp(datagram).map_err(codec_error)?;
    match packet {
        OscPacket::Message(message) => Ok(vec![parameter_from_message(&message)?]),
        OscPacket::Bundle(bundle) => {
            let mut updates = Vec::new();
            collect_bundle(&bundle, &mut updates);
            Ok(updates)
        }
    }
}

fn collect_bundle(bundle: &OscBundle, updates: &mut Vec<ParameterUpdate>) {
    for packet in &bundle.content {
        match packet {
            OscPacket::Message(message) => match parameter_from_message(message) {
                Ok(update) => updates.push(update),
                Err(err) => {
                    tracing::trace!(address = %message.addr, %err, "skipping bundled message")
                }
            },
            OscPacket::Bundle(inner) => collect_bundle(inner, updates),
        }
    }
}

fn parameter_from_message(message: &OscMessage) -> Result<ParameterUpdate> {
    let name = message
        .addr
        .strip_prefix(AVATAR_PARAMETER_PREFIX)
        .filter(|name| !name.is_empty())
        .ok_or(HaptickleError::Osc("not an avatar parameter address"))?;

    let value = match message.args.first() {
        Some(OscType::Float(value)) => ParameterValue::Float(*value),
        Some(OscType::Int(value)) => ParameterValue::Int(*value),
        Some(OscType::Bool(value)) => ParameterValue::Bool(*value),
        Some(_) => return Err(HaptickleError::Osc("unsupported argument type")),
        None => return Err(HaptickleError::Osc("missing argument")),
    };

    Ok(ParameterUpdate::new(name, value))
}

fn validate_address(address: &str) -> Result<()> {
    if !address.starts_with('/') {
        return Err(HaptickleError::Osc("address must start with `/`"));
    }
    if !address.is_ascii() || address.contains('\0') {
        return Err(HaptickleError::Osc("address must be plain ascii"));
    }
    Ok(())
}

fn codec_error(err: rosc::OscError) -> HaptickleError {
    HaptickleError::OscCodec(format!("{err:?}"))
}
