use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use terraform_instance::tags::attached_files;
use terraform_instance::{
    Attachment, EngineConfig, InstanceEngine, InstanceId, InstanceSpec, Result, Standalone, Tags,
    TerraformExecutor, TerraformOutput, VmType,
};

#[derive(Default)]
struct RecordingTerraform {
    calls: Mutex<Vec<String>>,
}

impl RecordingTerraform {
    fn record(&self, call: &str) -> Result<TerraformOutput> {
        self.calls.lock().unwrap().push(call.to_string());
        Ok(TerraformOutput {
            success: true,
            ..Default::default()
        })
    }

    fn applies(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == "apply")
            .count()
    }
}

#[async_trait]
impl TerraformExecutor for RecordingTerraform {
    async fn apply(&self, _refresh: bool) -> Result<TerraformOutput> {
        self.record("apply")
    }

    async fn refresh(&self) -> Result<TerraformOutput> {
        self.record("refresh")
    }

    async fn show(&self) -> Result<TerraformOutput> {
        self.record("show")
    }

    async fn state_show(&self, _address: &str) -> Result<TerraformOutput> {
        self.record("state show")
    }

    async fn state_list(&self) -> Result<TerraformOutput> {
        self.record("state list")
    }

    async fn import(&self, _address: &str, _cloud_id: &str) -> Result<TerraformOutput> {
        self.record("import")
    }

    async fn state_rm(&self, _address: &str) -> Result<TerraformOutput> {
        self.record("state rm")
    }
}

fn new_engine(dir: &std::path::Path) -> (InstanceEngine, Arc<RecordingTerraform>) {
    let tf = Arc::new(RecordingTerraform::default());
    let config = EngineConfig {
        settle_window: Duration::from_millis(10),
        poll_interval: Duration::from_secs(3600),
        lock_retry: Duration::from_millis(5),
        ..EngineConfig::new(dir)
    };
    let engine = InstanceEngine::with_parts(config, tf.clone(), Arc::new(Standalone));
    (engine, tf)
}

fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn vm_props(engine: &InstanceEngine, id: &InstanceId) -> serde_json::Value {
    let doc = engine.store().read(id.as_str()).unwrap();
    let (_, _, props) = terraform_instance::store::find_vm(&doc).unwrap();
    serde_json::Value::Object(props.clone())
}

#[tokio::test]
async fn test_provision_aws_instance_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, tf) = new_engine(dir.path());

    let spec = InstanceSpec {
        properties: json!({"resource": {"aws_instance": {"vm": {"ami": "ami-1"}}}}),
        tags: tags(&[("team", "x")]),
        init: "echo hi".to_string(),
        ..Default::default()
    };
    let id = engine.provision(spec).await.unwrap();

    let re = regex::Regex::new(r"^instance-\d+$").unwrap();
    assert!(re.is_match(id.as_str()), "unexpected id {id}");

    let props = vm_props(&engine, &id);
    assert_eq!(props["tags"], json!({"team": "x", "Name": id.as_str()}));
    let user_data = BASE64.decode(props["user_data"].as_str().unwrap()).unwrap();
    assert_eq!(user_data, b"echo hi");

    for _ in 0..200 {
        if tf.applies() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(tf.applies(), 1);
    engine.coordinator().stop();
}

#[tokio::test]
async fn test_scoped_resources_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _tf) = new_engine(dir.path());

    let spec = InstanceSpec {
        properties: json!({"resource": {
            "aws_instance": {"vm": {}},
            "aws_ebs_volume": {
                "boot": {},
                "data": {"@scope": "@dedicated"},
                "logs": {"@scope": "@dedicated"}
            },
            "aws_security_group": {
                "web": {"@scope": "net"},
                "ssh": {"@scope": "net"}
            },
            "aws_s3_bucket": {"artifacts": {"@scope": "storage"}}
        }}),
        ..Default::default()
    };
    let id = engine.provision(spec).await.unwrap();
    engine.coordinator().stop();

    let mut files: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with(".tf.json"))
        .collect();
    files.sort();
    assert_eq!(
        files,
        vec![
            format!("{id}-dedicated.tf.json"),
            format!("{id}.tf.json"),
            "scope-net.tf.json".to_string(),
            "scope-storage.tf.json".to_string(),
        ]
    );

    let own = engine.store().read(id.as_str()).unwrap();
    assert!(own.get("aws_ebs_volume", &format!("{id}-boot")).is_some());
    let dedicated = engine.store().read(&id.dedicated_stem()).unwrap();
    assert_eq!(dedicated.resource["aws_ebs_volume"].len(), 2);
    let net = engine.store().read("scope-net").unwrap();
    assert!(net.get("aws_security_group", "net-web").is_some());
    assert!(net.get("aws_security_group", "net-ssh").is_some());

    let doc = engine.store().read(id.as_str()).unwrap();
    let (_, _, props) = terraform_instance::store::find_vm(&doc).unwrap();
    assert_eq!(
        attached_files(VmType::Aws, props),
        vec![id.dedicated_stem(), "scope-net".to_string(), "scope-storage".to_string()]
    );
}

#[tokio::test]
async fn test_destroy_cascade_respects_shared_files() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _tf) = new_engine(dir.path());

    let a = engine
        .provision(InstanceSpec {
            properties: json!({"resource": {
                "aws_instance": {"vm": {}},
                "aws_ebs_volume": {"data": {"@scope": "@dedicated"}},
                "aws_security_group": {"sg": {"@scope": "X"}}
            }}),
            ..Default::default()
        })
        .await
        .unwrap();
    let b = engine
        .provision(InstanceSpec {
            properties: json!({"resource": {
                "aws_instance": {"vm": {}},
                "aws_security_group": {"sg": {"@scope": "X"}}
            }}),
            ..Default::default()
        })
        .await
        .unwrap();

    let store = engine.store();
    assert!(store.exists(a.as_str()));
    assert!(store.exists(&a.dedicated_stem()));
    assert!(store.exists("scope-X"));

    engine.destroy(&a).await.unwrap();
    assert!(!store.exists(a.as_str()));
    assert!(!store.exists(&a.dedicated_stem()));
    assert!(store.exists("scope-X"));
    assert!(store.exists(b.as_str()));

    engine.destroy(&b).await.unwrap();
    assert!(!store.exists(b.as_str()));
    assert!(!store.exists("scope-X"));
    engine.coordinator().stop();
}

#[tokio::test]
async fn test_destroy_cascades_through_attached_instance() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _tf) = new_engine(dir.path());

    let backend = engine
        .provision(InstanceSpec {
            properties: json!({"resource": {
                "aws_instance": {"vm": {}},
                "aws_ebs_volume": {"data": {"@scope": "@dedicated"}},
                "aws_security_group": {"sg": {"@scope": "db"}}
            }}),
            ..Default::default()
        })
        .await
        .unwrap();
    let front = engine
        .provision(InstanceSpec {
            properties: json!({"resource": {"aws_instance": {"vm": {}}}}),
            attachments: vec![Attachment {
                id: backend.to_string(),
                attachment_type: "instance".to_string(),
            }],
            ..Default::default()
        })
        .await
        .unwrap();

    engine.destroy(&front).await.unwrap();
    engine.coordinator().stop();

    let remaining: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with(".tf.json"))
        .collect();
    assert!(remaining.is_empty(), "left behind: {remaining:?}");
}

#[tokio::test]
async fn test_destroy_keeps_attached_instance_referenced_elsewhere() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _tf) = new_engine(dir.path());

    let backend = engine
        .provision(InstanceSpec {
            properties: json!({"resource": {
                "aws_instance": {"vm": {}},
                "aws_ebs_volume": {"data": {"@scope": "@dedicated"}}
            }}),
            ..Default::default()
        })
        .await
        .unwrap();
    let attached_to_backend = || InstanceSpec {
        properties: json!({"resource": {"aws_instance": {"vm": {}}}}),
        attachments: vec![Attachment {
            id: backend.to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };
    let first = engine.provision(attached_to_backend()).await.unwrap();
    let second = engine.provision(attached_to_backend()).await.unwrap();

    let store = engine.store();
    engine.destroy(&first).await.unwrap();
    assert!(!store.exists(first.as_str()));
    assert!(store.exists(backend.as_str()));
    assert!(store.exists(&backend.dedicated_stem()));

    engine.destroy(&second).await.unwrap();
    assert!(!store.exists(backend.as_str()));
    assert!(!store.exists(&backend.dedicated_stem()));
    engine.coordinator().stop();
}

#[tokio::test]
async fn test_describe_filters_by_all_tags() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _tf) = new_engine(dir.path());

    let spec = |t: Tags| InstanceSpec {
        properties: json!({"resource": {"aws_instance": {"vm": {}}}}),
        tags: t,
        ..Default::default()
    };
    let first = engine.provision(spec(tags(&[("a", "1")]))).await.unwrap();
    let second = engine
        .provision(spec(tags(&[("a", "1"), ("b", "2")])))
        .await
        .unwrap();
    engine.coordinator().stop();

    let ids = |found: Vec<terraform_instance::InstanceDescription>| {
        found.into_iter().map(|d| d.id).collect::<Vec<_>>()
    };

    let both = engine
        .describe_instances(&tags(&[("a", "1")]), false)
        .await
        .unwrap();
    assert_eq!(ids(both), vec![first.clone(), second.clone()]);

    let only_second = engine
        .describe_instances(&tags(&[("a", "1"), ("b", "2")]), false)
        .await
        .unwrap();
    assert_eq!(ids(only_second), vec![second]);

    let none = engine
        .describe_instances(&tags(&[("c", "x")]), false)
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_label_merges_tags() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _tf) = new_engine(dir.path());

    let id = engine
        .provision(InstanceSpec {
            properties: json!({"resource": {"digitalocean_droplet": {"vm": {}}}}),
            tags: tags(&[("team", "x")]),
            ..Default::default()
        })
        .await
        .unwrap();

    engine
        .label(&id, &tags(&[("team", "y"), ("stage", "prod")]))
        .await
        .unwrap();
    engine.coordinator().stop();

    let found = engine
        .describe_instances(&tags(&[("stage", "prod")]), false)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].tags["team"], "y");
    assert_eq!(found[0].tags["Name"], id.as_str());
}

#[tokio::test]
async fn test_concurrent_provisions_get_distinct_ids() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, tf) = new_engine(dir.path());
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .provision(InstanceSpec {
                    properties: json!({"resource": {"aws_instance": {"vm": {}}}}),
                    ..Default::default()
                })
                .await
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);

    for _ in 0..200 {
        if tf.applies() >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // Each provision wakes the loop at most once.
    assert!((1..=4).contains(&tf.applies()));
    engine.coordinator().stop();
}
