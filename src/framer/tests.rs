use std::cell::RefCell;
use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;
use rstest::{fixture, rstest};

use super::{CorruptionCounters, FrameSink, FramerConfig, FramingErrorKind, StreamFramer};
use crate::codec::{Message, PulseSample, attributes::ids};

#[derive(Default)]
struct RecordingSink {
    events: RefCell<Vec<Message>>,
    responses: RefCell<Vec<Message>>,
    errors: RefCell<Vec<FramingErrorKind>>,
}

impl FrameSink for RecordingSink {
    fn event_frame(&self, message: Message) { self.events.borrow_mut().push(message); }

    fn response_frame(&self, message: Message) { self.responses.borrow_mut().push(message); }

    fn framing_error(&self, kind: &FramingErrorKind) { self.errors.borrow_mut().push(*kind); }
}

#[fixture]
fn framer() -> StreamFramer {
    StreamFramer::new(FramerConfig::default(), Arc::new(CorruptionCounters::default()))
}

fn sample_messages() -> Vec<Message> {
    vec![
        Message::HeartbeatResponse,
        Message::RawPulseChanged {
            sample: PulseSample::Basic {
                ecg: -5000,
                ppg: 123,
            },
        },
        Message::FileDataChunk {
            fileref: 1,
            offset: 0,
            file_data: Bytes::from_static(b"abcdef"),
        },
        Message::Heartbeat,
    ]
}

fn stream_of(messages: &[Message]) -> Vec<u8> {
    messages.iter().flat_map(Message::encode).collect()
}

#[rstest]
fn frames_are_classified_and_kept_in_order(mut framer: StreamFramer) {
    let sink = RecordingSink::default();
    framer.feed(&stream_of(&sample_messages()), &sink);

    assert_eq!(
        *sink.events.borrow(),
        vec![
            Message::RawPulseChanged {
                sample: PulseSample::Basic {
                    ecg: -5000,
                    ppg: 123,
                },
            },
            Message::Heartbeat,
        ]
    );
    assert_eq!(
        *sink.responses.borrow(),
        vec![
            Message::HeartbeatResponse,
            Message::FileDataChunk {
                fileref: 1,
                offset: 0,
                file_data: Bytes::from_static(b"abcdef"),
            },
        ]
    );
    assert!(sink.errors.borrow().is_empty());
    assert_eq!(framer.carry_over_len(), 0);
}

#[rstest]
fn partial_frame_is_carried_over_until_completed(mut framer: StreamFramer) {
    let sink = RecordingSink::default();
    let encoded = Message::GetAttributeResponse {
        attribute_id: ids::BATTERY_LEVEL,
        value: crate::codec::attributes::AttributeValue::BatteryLevel(50),
    }
    .encode();
    let (head, tail) = encoded.split_at(4);

    framer.feed(head, &sink);
    assert!(sink.responses.borrow().is_empty());
    assert_eq!(framer.carry_over_len(), head.len());

    framer.feed(tail, &sink);
    assert_eq!(sink.responses.borrow().len(), 1);
    assert_eq!(framer.carry_over_len(), 0);
}

#[rstest]
fn byte_at_a_time_delivery_yields_every_frame(mut framer: StreamFramer) {
    let sink = RecordingSink::default();
    for byte in stream_of(&sample_messages()) {
        framer.feed(&[byte], &sink);
    }
    assert_eq!(sink.events.borrow().len(), 2);
    assert_eq!(sink.responses.borrow().len(), 2);
    assert!(sink.errors.borrow().is_empty());
}

#[rstest]
fn garbage_prefix_is_skipped_and_the_frame_recovered(mut framer: StreamFramer) {
    let sink = RecordingSink::default();
    let mut stream = vec![0xFE, 0xFD, 0xFC];
    stream.extend_from_slice(&Message::Heartbeat.encode());
    framer.feed(&stream, &sink);

    assert_eq!(*sink.events.borrow(), vec![Message::Heartbeat]);
    assert_eq!(sink.errors.borrow().len(), 3);
    let snapshot = framer.counters().snapshot();
    assert_eq!(snapshot.unknown_message_types, 3);
    assert_eq!(snapshot.resync_events, 3);
    assert_eq!(snapshot.crc_errors, 0);
}

#[rstest]
fn corrupted_frame_is_walked_past(mut framer: StreamFramer) {
    let sink = RecordingSink::default();
    let mut bad = Message::GetFile {
        file_name: "AAAAAA".to_owned(),
    }
    .encode();
    let last = bad.len() - 1;
    bad[last] ^= 0xFF;
    bad.extend_from_slice(&Message::HeartbeatResponse.encode());
    framer.feed(&bad, &sink);

    // The corrupted frame is abandoned a byte at a time; the next frame
    // still comes out intact.
    assert_eq!(*sink.responses.borrow(), vec![Message::HeartbeatResponse]);
    let snapshot = framer.counters().snapshot();
    assert_eq!(snapshot.crc_errors, 1);
    assert!(snapshot.resync_events >= 1);
}

#[rstest]
fn overflow_drops_the_buffer_once_and_keeps_going() {
    let counters = Arc::new(CorruptionCounters::default());
    let mut framer = StreamFramer::new(FramerConfig { max_buffer: 16 }, Arc::clone(&counters));
    let sink = RecordingSink::default();

    // A plausible header promising far more bytes than the cap allows.
    let mut stream = vec![crate::codec::msg_type::FILE_DATA_CHUNK, 0x10, 0x00];
    stream.extend_from_slice(&[0u8; 30]);
    framer.feed(&stream, &sink);

    assert_eq!(framer.carry_over_len(), 0);
    assert_eq!(counters.snapshot().buffer_overflows, 1);
    assert_eq!(
        *sink.errors.borrow(),
        vec![FramingErrorKind::BufferOverflow {
            limit: 16,
            dropped: 33,
        }]
    );

    framer.feed(&Message::Heartbeat.encode(), &sink);
    assert_eq!(*sink.events.borrow(), vec![Message::Heartbeat]);
}

#[rstest]
fn arbitrary_garbage_never_panics() {
    let counters = Arc::new(CorruptionCounters::default());
    let mut framer = StreamFramer::new(FramerConfig { max_buffer: 256 }, Arc::clone(&counters));
    let sink = RecordingSink::default();
    let garbage: Vec<u8> = (0..=255).chain(0..=255).collect();
    framer.feed(&garbage, &sink);

    // Garbage that happens to look like a frame header stalls the buffer
    // until the cap clears it; afterwards real frames flow again.
    assert!(counters.snapshot().buffer_overflows >= 1);
    framer.feed(&Message::Heartbeat.encode(), &sink);
    assert!(sink.events.borrow().contains(&Message::Heartbeat));
}

proptest! {
    #[test]
    fn fragmentation_does_not_change_the_output(
        splits in proptest::collection::vec(1usize..9, 1..32),
    ) {
        let messages = sample_messages();
        let stream = stream_of(&messages);

        let whole_sink = RecordingSink::default();
        let mut whole = StreamFramer::new(
            FramerConfig::default(),
            Arc::new(CorruptionCounters::default()),
        );
        whole.feed(&stream, &whole_sink);

        let split_sink = RecordingSink::default();
        let mut split = StreamFramer::new(
            FramerConfig::default(),
            Arc::new(CorruptionCounters::default()),
        );
        let mut rest = stream.as_slice();
        let mut cuts = splits.iter().cycle();
        while !rest.is_empty() {
            let take = (*cuts.next().expect("cycle never ends")).min(rest.len());
            let (head, tail) = rest.split_at(take);
            split.feed(head, &split_sink);
            rest = tail;
        }

        prop_assert_eq!(&*whole_sink.events.borrow(), &*split_sink.events.borrow());
        prop_assert_eq!(&*whole_sink.responses.borrow(), &*split_sink.responses.borrow());
        prop_assert!(split_sink.errors.borrow().is_empty());
    }
}
