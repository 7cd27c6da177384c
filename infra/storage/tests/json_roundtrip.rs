use proptest::prelude::*;
use regstore_storage::Storage;
use serde_json::{Map, Number, Value, json};
use tempfile::TempDir;

fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        any::<u64>().prop_map(|n| Value::Number(Number::from(n))),
        any::<f64>()
            .prop_filter("finite", |f| f.is_finite())
            .prop_map(|f| Number::from_f64(f).map_or(Value::Null, Value::Number)),
        any::<String>().prop_map(Value::String),
    ];

    leaf.prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
            proptest::collection::vec(("[a-z_-]{1,8}", inner), 0..8)
                .prop_map(|entries| Value::Object(entries.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn json_documents_roundtrip(doc in arb_json()) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let temp = TempDir::new().unwrap();

        let read: Value = rt.block_on(async {
            let storage = Storage::builder().root(temp.path()).fsync(false).connect().await.unwrap();
            storage.write_json("doc.json", &doc).await.unwrap();
            storage.read_json("doc.json").await.unwrap()
        });

        prop_assert_eq!(read, doc);
    }
}

#[tokio::test]
async fn test_object_keys_keep_insertion_order() {
    let temp = TempDir::new().unwrap();
    let storage = Storage::builder().root(temp.path()).connect().await.unwrap();
    let doc = json!({ "zeta": 1, "alpha": 2, "mid": { "y": true, "b": false } });

    storage.write_json("ordered.json", &doc).await.unwrap();
    let raw = String::from_utf8(storage.read("ordered.json").await.unwrap()).unwrap();

    assert_eq!(
        raw,
        "{\n\t\"zeta\": 1,\n\t\"alpha\": 2,\n\t\"mid\": {\n\t\t\"y\": true,\n\t\t\"b\": false\n\t}\n}"
    );
}

#[tokio::test]
async fn test_floats_survive_exactly() {
    let temp = TempDir::new().unwrap();
    let storage = Storage::builder().root(temp.path()).connect().await.unwrap();
    let doc = json!({ "weights": [1.0715660391465826e-75, 0.1, -2.5e300, 5e-324] });

    storage.write_json("floats.json", &doc).await.unwrap();
    let read: Value = storage.read_json("floats.json").await.unwrap();

    assert_eq!(read, doc);
}
