use crate::exporter::model::{Error, Span};

// Protocol documentation sourced from https://github.com/DataDog/datadog-agent/blob/c076ea9a1ffbde4c76d35343dbc32aecbbf99cb9/pkg/trace/api/version.go
//
// The v0.4 payload is an array of traces, where each trace is an array of spans. A span is
// a msgpack map keyed by field name:
//
// 	span_id   (uint64)
// 	trace_id  (uint64)
// 	parent_id (uint64)
// 	name      (string)
// 	service   (string)
// 	resource  (string)
// 	type      (string)
// 	start     (int64)
// 	duration  (int64)
// 	meta      (map[string]string, omitted when empty)
// 	metrics   (map[string]float64, omitted when empty)
// 	error     (int32)
//
// Only a single span is encoded here. The array framing around spans and traces is
// written by the request buffers once the final counts are known.
const SPAN_NUM_FIELDS: u32 = 12;

/// Appends the msgpack encoding of `span` to `writer`.
pub(crate) fn encode_span<W: std::io::Write>(writer: &mut W, span: &Span) -> Result<(), Error> {
    let mut fields = SPAN_NUM_FIELDS;
    if span.meta.is_empty() {
        fields -= 1;
    }
    if span.metrics.is_empty() {
        fields -= 1;
    }
    rmp::encode::write_map_len(writer, fields)?;

    rmp::encode::write_str(writer, "span_id")?;
    rmp::encode::write_u64(writer, span.span_id)?;

    rmp::encode::write_str(writer, "trace_id")?;
    rmp::encode::write_u64(writer, span.trace_id)?;

    rmp::encode::write_str(writer, "parent_id")?;
    rmp::encode::write_u64(writer, span.parent_id)?;

    rmp::encode::write_str(writer, "name")?;
    rmp::encode::write_str(writer, &span.name)?;

    rmp::encode::write_str(writer, "service")?;
    rmp::encode::write_str(writer, &span.service)?;

    rmp::encode::write_str(writer, "resource")?;
    rmp::encode::write_str(writer, &span.resource)?;

    rmp::encode::write_str(writer, "type")?;
    rmp::encode::write_str(writer, &span.r#type)?;

    rmp::encode::write_str(writer, "start")?;
    rmp::encode::write_i64(writer, span.start)?;

    rmp::encode::write_str(writer, "duration")?;
    rmp::encode::write_i64(writer, span.duration)?;

    if !span.meta.is_empty() {
        rmp::encode::write_str(writer, "meta")?;
        rmp::encode::write_map_len(writer, span.meta.len() as u32)?;
        for (key, value) in span.meta.iter() {
            rmp::encode::write_str(writer, key)?;
            rmp::encode::write_str(writer, value)?;
        }
    }

    if !span.metrics.is_empty() {
        rmp::encode::write_str(writer, "metrics")?;
        rmp::encode::write_map_len(writer, span.metrics.len() as u32)?;
        for (key, value) in span.metrics.iter() {
            rmp::encode::write_str(writer, key)?;
            rmp::encode::write_f64(writer, *value)?;
        }
    }

    rmp::encode::write_str(writer, "error")?;
    rmp::encode::write_i32(writer, span.error)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::model::tests::get_span;
    use indexmap::IndexMap;

    fn read_key(rd: &mut &[u8]) -> String {
        let len = rmp::decode::read_str_len(rd).unwrap() as usize;
        let (key, rest) = rd.split_at(len);
        *rd = rest;
        String::from_utf8(key.to_vec()).unwrap()
    }

    fn read_str(rd: &mut &[u8]) -> String {
        read_key(rd)
    }

    #[test]
    fn test_encode_span_fields() {
        let span = get_span(7, 1, 99);
        let mut buf = Vec::new();
        encode_span(&mut buf, &span).unwrap();

        let mut rd = buf.as_slice();
        assert_eq!(rmp::decode::read_map_len(&mut rd).unwrap(), 12);

        assert_eq!(read_key(&mut rd), "span_id");
        assert_eq!(rmp::decode::read_u64(&mut rd).unwrap(), 99);
        assert_eq!(read_key(&mut rd), "trace_id");
        assert_eq!(rmp::decode::read_u64(&mut rd).unwrap(), 7);
        assert_eq!(read_key(&mut rd), "parent_id");
        assert_eq!(rmp::decode::read_u64(&mut rd).unwrap(), 1);
        assert_eq!(read_key(&mut rd), "name");
        assert_eq!(read_str(&mut rd), "opentelemetry");
        assert_eq!(read_key(&mut rd), "service");
        assert_eq!(read_str(&mut rd), "service_name");
        assert_eq!(read_key(&mut rd), "resource");
        assert_eq!(read_str(&mut rd), "resource");
        assert_eq!(read_key(&mut rd), "type");
        assert_eq!(read_str(&mut rd), "server");
        assert_eq!(read_key(&mut rd), "start");
        assert_eq!(rmp::decode::read_i64(&mut rd).unwrap(), 5_000_000_000);
        assert_eq!(read_key(&mut rd), "duration");
        assert_eq!(rmp::decode::read_i64(&mut rd).unwrap(), 1_000_000_000);
        assert_eq!(read_key(&mut rd), "meta");
        assert_eq!(rmp::decode::read_map_len(&mut rd).unwrap(), 1);
        assert_eq!(read_key(&mut rd), "http.method");
        assert_eq!(read_str(&mut rd), "GET");
        assert_eq!(read_key(&mut rd), "metrics");
        assert_eq!(rmp::decode::read_map_len(&mut rd).unwrap(), 1);
        assert_eq!(read_key(&mut rd), "_sampling_priority_v1");
        assert_eq!(rmp::decode::read_f64(&mut rd).unwrap(), 1.0);
        assert_eq!(read_key(&mut rd), "error");
        assert_eq!(rmp::decode::read_i32(&mut rd).unwrap(), 0);
        assert!(rd.is_empty());
    }

    #[test]
    fn test_encode_span_omits_empty_maps() {
        let mut span = get_span(7, 0, 99);
        span.meta = IndexMap::new();
        span.metrics = IndexMap::new();

        let mut buf = Vec::new();
        encode_span(&mut buf, &span).unwrap();

        let mut rd = buf.as_slice();
        assert_eq!(rmp::decode::read_map_len(&mut rd).unwrap(), 10);
        let keys: Vec<String> = (0..10)
            .map(|_| {
                let key = read_key(&mut rd);
                skip_value(&mut rd);
                key
            })
            .collect();
        assert!(!keys.iter().any(|k| k == "meta" || k == "metrics"));
        assert_eq!(keys.last().map(String::as_str), Some("error"));
        assert!(rd.is_empty());
    }

    fn skip_value(rd: &mut &[u8]) {
        let marker = rmp::decode::read_marker(rd).unwrap();
        let skip = match marker {
            rmp::Marker::U64 | rmp::Marker::I64 | rmp::Marker::F64 => 8,
            rmp::Marker::I32 => 4,
            rmp::Marker::FixStr(len) => len as usize,
            other => panic!("unexpected marker {other:?}"),
        };
        *rd = &rd[skip..];
    }

    #[test]
    fn test_encode_span_is_deterministic() {
        let span = get_span(7, 1, 99);
        let mut first = Vec::new();
        let mut second = Vec::new();
        encode_span(&mut first, &span).unwrap();
        encode_span(&mut second, &span).unwrap();
        assert_eq!(first, second);
    }
}
