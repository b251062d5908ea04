use crate::storage::{BucketEntry, ObjectEntry};
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::de::from_str;
use serde::Deserialize;

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn s3_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn list_buckets(buckets: &[BucketEntry]) -> String {
    let mut body = String::new();
    body.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    body.push_str("<ListAllMyBucketsResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">");
    body.push_str("<Buckets>");
    for bucket in buckets {
        body.push_str("<Bucket>");
        push_xml_field(&mut body, "Name", &bucket.name);
        push_xml_field(&mut body, "CreationDate", &s3_timestamp(bucket.created_at));
        body.push_str("</Bucket>");
    }
    body.push_str("</Buckets></ListAllMyBucketsResult>");
    body
}

pub fn list_objects(bucket: &str, objects: &[ObjectEntry]) -> String {
    build_list_bucket_result(bucket, objects, None)
}

pub fn list_objects_v2(bucket: &str, objects: &[ObjectEntry]) -> String {
    build_list_bucket_result(bucket, objects, Some(objects.len()))
}

fn build_list_bucket_result(
    bucket: &str,
    objects: &[ObjectEntry],
    key_count: Option<usize>,
) -> String {
    let mut body = String::new();
    body.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    body.push_str("<ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">");
    push_xml_field(&mut body, "Name", bucket);
    if let Some(count) = key_count {
        push_xml_number(&mut body, "KeyCount", count as i64);
    }
    for object in objects {
        body.push_str("<Contents>");
        push_xml_field(&mut body, "Key", &object.key);
        push_xml_field(&mut body, "LastModified", &s3_timestamp(object.last_modified));
        push_xml_field(&mut body, "Size", &object.size.to_string());
        body.push_str("</Contents>");
    }
    body.push_str("</ListBucketResult>");
    body
}

pub fn copy_object_result(etag: &str, last_modified: DateTime<Utc>) -> String {
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>",
            "<CopyObjectResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">",
            "<ETag>{}</ETag><LastModified>{}</LastModified>",
            "</CopyObjectResult>"
        ),
        xml_escape(&format!("\"{}\"", etag)),
        s3_timestamp(last_modified)
    )
}

/// Batch-delete response. Every requested key is reported as deleted,
/// whether or not it existed.
pub fn delete_result(keys: &[String]) -> String {
    let mut body = String::new();
    body.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    body.push_str("<DeleteResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">");
    for key in keys {
        body.push_str("<Deleted>");
        push_xml_field(&mut body, "Key", key);
        body.push_str("</Deleted>");
    }
    body.push_str("</DeleteResult>");
    body
}

fn push_xml_field(body: &mut String, tag: &str, value: &str) {
    body.push_str(&format!("<{}>{}</{}>", tag, xml_escape(value), tag));
}

fn push_xml_number(body: &mut String, tag: &str, value: i64) {
    body.push_str(&format!("<{}>{}</{}>", tag, value, tag));
}

#[derive(Debug, Deserialize)]
#[serde(rename = "Delete")]
struct DeleteObjectsRequest {
    #[serde(rename = "Object")]
    objects: Vec<DeleteObject>,
}

#[derive(Debug, Deserialize)]
struct DeleteObject {
    #[serde(rename = "Key")]
    key: String,
}

pub fn parse_delete_objects(body: &[u8]) -> Result<Vec<String>, String> {
    let parsed: DeleteObjectsRequest =
        from_str(&String::from_utf8_lossy(body)).map_err(|_| "invalid xml")?;
    Ok(parsed.objects.into_iter().map(|obj| obj.key).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BucketEntry, ObjectEntry};
    use chrono::Utc;

    fn sample_bucket(name: &str) -> BucketEntry {
        BucketEntry {
            name: name.to_string(),
            created_at: Utc::now(),
        }
    }

    fn sample_object(key: &str) -> ObjectEntry {
        ObjectEntry {
            key: key.to_string(),
            size: 12,
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn list_buckets_escapes_values() {
        let body = list_buckets(&[sample_bucket("a&b")]);
        assert!(body.contains("<Name>a&amp;b</Name>"));
        assert!(body.contains("<CreationDate>"));
        assert!(body.contains("ListAllMyBucketsResult"));
    }

    #[test]
    fn list_objects_emits_contents_without_key_count() {
        let body = list_objects("bucket", &[sample_object("photo.jpg")]);
        assert!(body.contains("<Key>photo.jpg</Key>"));
        assert!(body.contains("<Size>12</Size>"));
        assert!(!body.contains("<KeyCount>"));
    }

    #[test]
    fn list_objects_v2_counts_returned_keys() {
        let objects = vec![sample_object("a"), sample_object("b")];
        let body = list_objects_v2("bucket", &objects);
        assert!(body.contains("<KeyCount>2</KeyCount>"));

        let empty = list_objects_v2("bucket", &[]);
        assert!(empty.contains("<KeyCount>0</KeyCount>"));
    }

    #[test]
    fn copy_object_result_carries_quoted_etag() {
        let body = copy_object_result("abc123", Utc::now());
        assert!(body.contains("&quot;abc123&quot;"));
        assert!(body.contains("<LastModified>"));
    }

    #[test]
    fn delete_result_lists_every_key() {
        let keys = vec!["del1.txt".to_string(), "missing & gone".to_string()];
        let body = delete_result(&keys);
        assert!(body.contains("<Deleted><Key>del1.txt</Key></Deleted>"));
        assert!(body.contains("<Deleted><Key>missing &amp; gone</Key></Deleted>"));
    }

    #[test]
    fn parse_delete_objects_variants() {
        let xml = b"<Delete><Object><Key>a</Key></Object><Object><Key>b</Key></Object></Delete>";
        let keys = parse_delete_objects(xml).expect("keys");
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        let err = parse_delete_objects(b"<Delete><Object></Delete>").unwrap_err();
        assert_eq!(err, "invalid xml");
    }
}
