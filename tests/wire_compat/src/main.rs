fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use filepump_protocol::{
        CallHeader, ChunkFrame, DownloadRequest, ListFilesRequest, ListFilesResponse, Message,
        MessageType, Method, StatusCode, UploadRequest, UploadResponse,
    };

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_fixture(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and compares
    /// the JSON values (order-independent comparison).
    ///
    /// Parses from text rather than a `Value` so raw payloads survive.
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let text = load_fixture(name);
        let parsed: T = serde_json::from_str(&text)
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_string(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        let fixture: serde_json::Value = serde_json::from_str(&text).unwrap();
        let roundtripped: serde_json::Value = serde_json::from_str(&reserialized).unwrap();
        assert_eq!(
            fixture, roundtripped,
            "roundtrip mismatch for {name}:\n  fixture: {text}\n  rust:    {reserialized}"
        );
        parsed
    }

    // --- Envelope ---

    #[test]
    fn fixture_message_call() {
        let msg: Message = roundtrip_test("message_call.json");
        assert_eq!(msg.msg_type, MessageType::Call);
        let header: CallHeader = msg.parse_payload().unwrap().unwrap();
        assert_eq!(header.method, Method::UploadAndNotifyProgress);
        assert_eq!(header.bearer_token(), Some("3f2a9c"));
    }

    #[test]
    fn fixture_message_data_chunk() {
        let msg: Message = roundtrip_test("message_data_chunk.json");
        let frame: ChunkFrame = msg.parse_payload().unwrap().unwrap();
        assert_eq!(frame.sequence, 4);
        assert_eq!(frame.data, vec![0, 1, 2, 3, 255]);
        assert!(frame.is_final);
    }

    #[test]
    fn fixture_message_close_send() {
        let msg: Message = roundtrip_test("message_close_send.json");
        assert_eq!(msg.msg_type, MessageType::CloseSend);
        assert!(msg.payload.is_none());
        assert!(msg.status.is_none());
    }

    #[test]
    fn fixture_message_status_not_found() {
        let msg: Message = roundtrip_test("message_status_not_found.json");
        let status = msg.status.unwrap();
        assert_eq!(status.code, StatusCode::NotFound);
        assert_eq!(status.message, "file was not found");
    }

    #[test]
    fn fixture_message_status_ok_omits_message() {
        let msg: Message = roundtrip_test("message_status_ok.json");
        assert!(msg.status.unwrap().is_ok());
    }

    // --- Payloads ---

    #[test]
    fn fixture_call_header_anonymous() {
        let header: CallHeader = roundtrip_test("call_header_anonymous.json");
        assert_eq!(header.method, Method::ListFiles);
        assert!(header.bearer_token().is_none());
    }

    #[test]
    fn fixture_list_files() {
        roundtrip_test::<ListFilesRequest>("list_files_request.json");
        let response: ListFilesResponse = roundtrip_test("list_files_response.json");
        assert_eq!(response.filenames, vec!["alpha.txt", "zeta.bin"]);
    }

    #[test]
    fn fixture_download_request() {
        let request: DownloadRequest = roundtrip_test("download_request.json");
        assert_eq!(request.filename, "reports/q3.pdf");
    }

    #[test]
    fn fixture_upload_requests() {
        let named: UploadRequest = roundtrip_test("upload_request_named.json");
        assert_eq!(named.filename.as_deref(), Some("upload.bin"));
        let anonymous: UploadRequest = roundtrip_test("upload_request_anonymous.json");
        assert!(anonymous.filename.is_none());
    }

    #[test]
    fn fixture_upload_response() {
        let response: UploadResponse = roundtrip_test("upload_response.json");
        assert_eq!(response.size, 3500);
        assert_eq!(response.checksum.len(), 64);
    }

    #[test]
    fn fixture_chunk_frame_keeps_full_sequence() {
        let frame: ChunkFrame = roundtrip_test("chunk_frame_max_sequence.json");
        assert_eq!(frame.sequence, u64::MAX);
        assert!(frame.data.is_empty());
    }
}
