use super::*;
use crate::domain::FILE_TYPE_IMAGE;

fn outgoing() -> ChatMessage {
    ChatMessage {
        id: "m-1".to_string(),
        text: "hello".to_string(),
        created_at: "2024-01-01T10:00:00.000Z".to_string(),
        user: ChatUser {
            id: "alice".to_string(),
        },
        voice: false,
        receiver_id: None,
        attachment_path: None,
        image: None,
        document_name: None,
    }
}

#[test]
fn chat_to_wire_and_back_keeps_identity_fields() {
    let original = outgoing();
    let wire = WireMessage::from_chat("bob", &original, None);
    let restored = wire.to_chat();

    assert_eq!(restored.id, original.id);
    assert_eq!(restored.text, original.text);
    assert_eq!(restored.created_at, original.created_at);
    assert_eq!(restored.user, original.user);
    assert_eq!(restored.receiver_id.as_deref(), Some("bob"));
}

#[test]
fn absent_optional_fields_travel_as_null_strings() {
    let wire = WireMessage::from_chat("bob", &outgoing(), None);
    let value: serde_json::Value =
        serde_json::from_str(&wire.to_json().expect("encode")).expect("json");

    assert_eq!(value["fileName"], "null");
    assert_eq!(value["fileType"], "null");
    assert_eq!(value["groupId"], "null");
    assert_eq!(value["isFile"], false);
    assert_eq!(value["senderId"], "alice");
    assert_eq!(value["receiverId"], "bob");
}

#[test]
fn attachment_metadata_is_declared_on_the_wire() {
    let attachment = Attachment {
        file: "aGVsbG8=".to_string(),
        file_name: "cat.png".to_string(),
        file_type: FILE_TYPE_IMAGE.to_string(),
    };
    let wire = WireMessage::from_chat("bob", &outgoing(), Some(&attachment));

    assert!(wire.declares_attachment());
    assert_eq!(wire.file_name.as_deref(), Some("cat.png"));
    let rebuilt = wire.attachment_with("Zm9v".to_string());
    assert_eq!(rebuilt.file, "Zm9v");
    assert!(rebuilt.is_image());
}

#[test]
fn parses_server_payload_with_null_sentinels_and_missing_text() {
    let raw = r#"{
        "id": "m-9",
        "isVoice": false,
        "isFile": false,
        "fileName": "null",
        "fileType": "null",
        "createdAt": "2024-03-02T08:15:00.120Z",
        "senderId": "peer-1",
        "receiverId": "me",
        "groupId": "null"
    }"#;

    let wire = WireMessage::from_json(raw).expect("decode");
    assert_eq!(wire.file_name, None);
    assert_eq!(wire.group_id, None);
    assert!(!wire.declares_attachment());
    assert_eq!(wire.to_chat().text, "");
}

#[test]
fn file_flag_without_name_does_not_declare_attachment() {
    let raw = r#"{"id":"m","isFile":true,"fileName":"null","createdAt":"x","senderId":"p"}"#;
    let wire = WireMessage::from_json(raw).expect("decode");
    assert!(!wire.declares_attachment());
}

#[test]
fn rejects_payload_without_sender() {
    let raw = r#"{"id":"m-1","createdAt":"2024-01-01T00:00:00Z","senderId":""}"#;
    let err = WireMessage::from_json(raw).expect_err("must fail");
    assert!(matches!(err, ConversionError::MissingField("senderId")));

    assert!(matches!(
        WireMessage::from_json("not json"),
        Err(ConversionError::Malformed(_))
    ));
}
