use bytes::Bytes;
use rstest::rstest;

use super::attributes::{
    AccRaw, AfeSettings, AttributeValue, Diagnostics, ImuRaw, Leds, Temperature, ids,
};
use super::{DecodeError, Message, MIN_FRAME_LEN, PulseSample, crc16, decode, msg_type};

fn round_trip(message: &Message) -> Message {
    let encoded = message.encode();
    let (decoded, consumed) = decode(&encoded).expect("encoded frame decodes");
    assert_eq!(consumed, encoded.len());
    assert_eq!(consumed, message.encoded_len());
    decoded
}

#[rstest]
#[case::heartbeat(Message::Heartbeat)]
#[case::heartbeat_response(Message::HeartbeatResponse)]
#[case::get_attribute(Message::GetAttribute { attribute_id: ids::BATTERY_LEVEL })]
#[case::configure_reporting(Message::ConfigureReporting {
    attribute_id: ids::HEARTRATE,
    interval: 1000,
    reporting_mode: 0x01,
})]
#[case::reset_reporting(Message::ResetReporting { attribute_id: ids::HEARTRATE })]
#[case::get_file(Message::GetFile { file_name: "log_2024.bin".to_owned() })]
#[case::configure_reporting_response(Message::ConfigureReportingResponse)]
#[case::reset_reporting_response(Message::ResetReportingResponse)]
#[case::get_file_response(Message::GetFileResponse)]
#[case::raw_pulse_basic(Message::RawPulseChanged {
    sample: PulseSample::Basic { ecg: -120_345, ppg: 44_991 },
})]
#[case::raw_pulse_all(Message::RawPulseChanged {
    sample: PulseSample::AllChannels {
        ecg: 1,
        ppg_green: -2,
        ppg_red: 3,
        ppg_ir: -4,
    },
})]
#[case::raw_pulse_list(Message::RawPulseListChanged {
    ecgs: vec![10, -20, 30],
    ppgs: vec![-1, 2],
})]
#[case::file_chunk(Message::FileDataChunk {
    fileref: 7,
    offset: 4096,
    file_data: Bytes::from_static(b"chunk payload"),
})]
fn messages_survive_a_round_trip(#[case] message: Message) {
    assert_eq!(round_trip(&message), message);
}

#[rstest]
#[case::serial_no(AttributeValue::SerialNo(0x0123_4567_89AB_CDEF))]
#[case::battery(AttributeValue::BatteryLevel(87))]
#[case::heartrate(AttributeValue::Heartrate(62))]
#[case::charge_state(AttributeValue::ChargeState(true))]
#[case::belt_on_body(AttributeValue::BeltOnBody(false))]
#[case::measurement_deactivated(AttributeValue::MeasurementDeactivated(1))]
#[case::temperature(AttributeValue::Temperature(Temperature { raw: 3200 }))]
#[case::imu(AttributeValue::Imu { orientation_and_activity: 0x52 })]
#[case::imu_raw(AttributeValue::ImuRaw(ImuRaw {
    acc_x: -100,
    acc_y: 200,
    acc_z: -300,
    gyr_x: 400,
    gyr_y: -500,
    gyr_z: 600,
}))]
#[case::acc_raw(AttributeValue::AccRaw(AccRaw { acc_x: 1, acc_y: -2, acc_z: 3 }))]
#[case::leds(AttributeValue::Leds(Leds {
    led1: true,
    led1_blinking: false,
    led2: false,
    led2_blinking: true,
    led3: true,
    led3_blinking: true,
}))]
#[case::diagnostics(AttributeValue::Diagnostics(Diagnostics {
    rep_soc: 9500,
    avg_current: -120,
    rep_cap: 1800,
    full_cap: 2000,
    tte: 360_000,
    ttf: 0,
    voltage: 4100,
    avg_voltage: 4080,
}))]
#[case::afe_basic(AttributeValue::AfeSettings(AfeSettings {
    rf_gain: 4,
    cf_value: 2,
    ecg_gain: 3,
    ioffdac_range: 1,
    led1: 10_000,
    led4: 20_000,
    off_dac1: 300,
    relative_gain: 1.5,
    led2: None,
    led3: None,
    off_dac2: None,
    off_dac3: None,
}))]
#[case::afe_all(AttributeValue::AfeSettings(AfeSettings {
    rf_gain: 4,
    cf_value: 2,
    ecg_gain: 3,
    ioffdac_range: 1,
    led1: 10_000,
    led4: 20_000,
    off_dac1: 300,
    relative_gain: 0.25,
    led2: Some(11_000),
    led3: Some(12_000),
    off_dac2: Some(310),
    off_dac3: Some(320),
}))]
fn attribute_values_survive_a_round_trip(#[case] value: AttributeValue) {
    let attribute_id = value.attribute_id();
    let message = Message::AttributeChanged {
        attribute_id,
        value,
    };
    assert_eq!(round_trip(&message), message);
}

#[test]
fn attribute_response_and_event_share_the_payload_shape() {
    let message = Message::GetAttributeResponse {
        attribute_id: ids::HEARTRATE,
        value: AttributeValue::Heartrate(70),
    };
    assert_eq!(round_trip(&message), message);
    assert!(message.is_response());
    assert!(
        !Message::AttributeChanged {
            attribute_id: ids::HEARTRATE,
            value: AttributeValue::Heartrate(70),
        }
        .is_response()
    );
}

#[test]
fn unknown_attribute_ids_are_preserved_verbatim() {
    let message = Message::AttributeChanged {
        attribute_id: 0x7E,
        value: AttributeValue::Unknown {
            attribute_id: 0x7E,
            data: vec![0xDE, 0xAD, 0xBE, 0xEF],
        },
    };
    match round_trip(&message) {
        Message::AttributeChanged {
            attribute_id: 0x7E,
            value: AttributeValue::Unknown { attribute_id, data },
        } => {
            assert_eq!(attribute_id, 0x7E);
            assert_eq!(data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        }
        other => panic!("unexpected decode: {other:?}"),
    }
}

#[rstest]
#[case::empty(&[], 3)]
#[case::partial_header(&[msg_type::HEARTBEAT, 0x00], 3)]
fn short_headers_report_incomplete(#[case] src: &[u8], #[case] needed: usize) {
    assert_eq!(
        decode(src),
        Err(DecodeError::Incomplete {
            needed,
            available: src.len(),
        })
    );
}

#[test]
fn truncated_frame_reports_remaining_need() {
    let encoded = Message::GetFile {
        file_name: "data.bin".to_owned(),
    }
    .encode();
    let cut = encoded.len() - 3;
    assert_eq!(
        decode(&encoded[..cut]),
        Err(DecodeError::Incomplete {
            needed: encoded.len(),
            available: cut,
        })
    );
}

#[test]
fn unknown_message_type_is_reported() {
    assert_eq!(decode(&[0x6F, 0x00, 0x05]), Err(DecodeError::UnknownType(0x6F)));
}

#[test]
fn a_lone_garbage_byte_is_unknown_not_incomplete() {
    // The type byte is enough to rule the bytes out; a partial header only
    // buys time for recognised types.
    assert_eq!(decode(&[0xFE]), Err(DecodeError::UnknownType(0xFE)));
}

#[test]
fn length_below_minimum_is_rejected() {
    let src = [msg_type::HEARTBEAT, 0x00, 0x02, 0x00, 0x00];
    assert_eq!(decode(&src), Err(DecodeError::BadLength { length: 2 }));
}

#[test]
fn corrupted_crc_is_detected() {
    let mut encoded = Message::Heartbeat.encode();
    let last = encoded.len() - 1;
    encoded[last] ^= 0xFF;
    match decode(&encoded) {
        Err(DecodeError::CrcMismatch { computed, received }) => {
            assert_ne!(computed, received);
            assert_eq!(computed, crc16(&encoded[..encoded.len() - 2]));
        }
        other => panic!("unexpected decode: {other:?}"),
    }
}

#[test]
fn corrupted_payload_byte_is_detected_by_crc() {
    let mut encoded = Message::GetAttribute {
        attribute_id: ids::BATTERY_LEVEL,
    }
    .encode();
    encoded[3] ^= 0x01;
    assert!(matches!(
        decode(&encoded),
        Err(DecodeError::CrcMismatch { .. })
    ));
}

fn frame_with_payload(msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let length = u16::try_from(MIN_FRAME_LEN + payload.len()).expect("test frame fits");
    let mut frame = vec![msg_type];
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(payload);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

#[rstest]
#[case::heartbeat_with_payload(msg_type::HEARTBEAT, &[0x01])]
#[case::get_attribute_empty(msg_type::GET_ATTRIBUTE, &[])]
#[case::raw_pulse_odd_length(msg_type::RAW_PULSE_CHANGED, &[0x00; 12])]
#[case::pulse_list_counts_disagree(msg_type::RAW_PULSE_LIST_CHANGED, &[2, 1, 0, 0, 0, 0])]
#[case::file_chunk_too_short(msg_type::FILE_DATA_CHUNK, &[0x01, 0x00, 0x00])]
#[case::bad_utf8_file_name(msg_type::GET_FILE, &[0xFF, 0xFE])]
fn malformed_payloads_are_rejected(#[case] msg_type: u8, #[case] payload: &[u8]) {
    let frame = frame_with_payload(msg_type, payload);
    assert!(matches!(
        decode(&frame),
        Err(DecodeError::Payload { msg_type: t, .. }) if t == msg_type
    ));
}

#[test]
fn truncated_attribute_payload_is_a_payload_error() {
    // Heartrate is two bytes; send one.
    let frame = frame_with_payload(msg_type::ATTRIBUTE_CHANGED, &[ids::HEARTRATE, 0x40]);
    assert!(matches!(
        decode(&frame),
        Err(DecodeError::Payload { msg_type: t, .. }) if t == msg_type::ATTRIBUTE_CHANGED
    ));
}

#[test]
fn decode_consumes_exactly_one_frame() {
    let first = Message::Heartbeat.encode();
    let second = Message::GetAttribute {
        attribute_id: ids::SLEEP_MODE,
    }
    .encode();
    let mut stream = first.clone();
    stream.extend_from_slice(&second);
    let (message, consumed) = decode(&stream).expect("first frame decodes");
    assert_eq!(message, Message::Heartbeat);
    assert_eq!(consumed, first.len());
    let (message, consumed) = decode(&stream[first.len()..]).expect("second frame decodes");
    assert_eq!(
        message,
        Message::GetAttribute {
            attribute_id: ids::SLEEP_MODE,
        }
    );
    assert_eq!(consumed, second.len());
}

#[test]
fn crc16_matches_the_ccitt_false_check_value() {
    // Standard check input for CRC-16/CCITT-FALSE.
    assert_eq!(crc16(b"123456789"), 0x29B1);
}

#[test]
fn temperature_conversion_uses_the_sensor_step() {
    let t = Temperature { raw: 3200 };
    assert!((t.celsius() - 25.0).abs() < f32::EPSILON);
    let below_zero = Temperature { raw: -128 };
    assert!((below_zero.celsius() + 1.0).abs() < f32::EPSILON);
}
