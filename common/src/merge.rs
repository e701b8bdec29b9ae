//! Upsert de propiedades línea a línea.
//!
//! Para cada clave: si ya existe una línea que la define, se reemplaza esa
//! línea en su sitio; si no, se añade una línea nueva. Es el algoritmo que
//! ejecuta `propmerge` en cada host.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

const XML_HEADER: &str = "<?xml version=\"1.0\"?>";
const XML_STYLESHEET: &str = "<?xml-stylesheet type=\"text/xsl\" href=\"configuration.xsl\"?>";
const XML_OPEN: &str = "<configuration>";
const XML_CLOSE: &str = "</configuration>";
const PROPERTY_CLOSE: &str = "</property>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineFormat {
    /// `clave = valor` (zoo.cfg)
    KeyValue,
    /// `<property><name>k</name><value>v</value></property>` (*-site.xml)
    HadoopXml,
    /// `export CLAVE="valor"` (fichero de entorno); `$` se expande al cargarlo
    Export,
    /// `ip nombre` (/etc/hosts), la clave es la IP
    Hosts,
}

impl LineFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineFormat::KeyValue => "kv",
            LineFormat::HadoopXml => "xml",
            LineFormat::Export => "export",
            LineFormat::Hosts => "hosts",
        }
    }

    pub fn render(&self, key: &str, value: &str) -> String {
        match self {
            LineFormat::KeyValue => format!("{} = {}", key, value),
            LineFormat::HadoopXml => format!(
                "  <property><name>{}</name><value>{}</value></property>",
                key, value
            ),
            LineFormat::Export => format!("export {}=\"{}\"", key, double_quoted(value)),
            LineFormat::Hosts => format!("{} {}", key, value),
        }
    }

    /// ¿Define `line` la clave `key`?
    pub fn defines(&self, line: &str, key: &str) -> bool {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            return false;
        }
        match self {
            LineFormat::KeyValue => trimmed
                .split_once('=')
                .map(|(k, _)| k.trim() == key)
                .unwrap_or(false),
            LineFormat::HadoopXml => property_name(line) == Some(key),
            LineFormat::Export => trimmed
                .strip_prefix("export")
                .filter(|rest| rest.starts_with(char::is_whitespace))
                .and_then(|rest| rest.trim_start().split_once('='))
                .map(|(k, _)| k == key)
                .unwrap_or(false),
            LineFormat::Hosts => trimmed.split_whitespace().next() == Some(key),
        }
    }
}

// Escapa lo que rompería unas comillas dobles, pero deja `$` tal cual.
fn double_quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl fmt::Display for LineFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LineFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kv" => Ok(LineFormat::KeyValue),
            "xml" => Ok(LineFormat::HadoopXml),
            "export" => Ok(LineFormat::Export),
            "hosts" => Ok(LineFormat::Hosts),
            other => Err(format!("formato desconocido: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("<property> sin cerrar en la posición {0}")]
    UnclosedProperty(usize),
    #[error("el fichero no tiene un elemento <configuration> utilizable")]
    MissingRoot,
}

/// Aplica `props` sobre `content` y devuelve el texto resultante.
///
/// Solo se reemplaza la primera definición de cada clave. La salida
/// termina siempre en salto de línea.
pub fn upsert(
    content: &str,
    props: &[(String, String)],
    format: LineFormat,
) -> Result<String, MergeError> {
    if format == LineFormat::HadoopXml {
        return upsert_xml(content, props);
    }

    let mut lines: Vec<String> = content.lines().map(|l| l.to_string()).collect();
    for (key, value) in props {
        let rendered = format.render(key, value);
        match lines.iter().position(|l| format.defines(l, key)) {
            Some(idx) => lines[idx] = rendered,
            None => lines.push(rendered),
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out)
}

/// En XML la unidad es el elemento `<property>` completo, ocupe las líneas
/// que ocupe; las propiedades nuevas van justo antes de `</configuration>`.
fn upsert_xml(content: &str, props: &[(String, String)]) -> Result<String, MergeError> {
    let mut doc = open_root(content);
    for (key, value) in props {
        let rendered = LineFormat::HadoopXml.render(key, value);
        match find_property(&doc, key)? {
            Some(span) => doc.replace_range(span, rendered.trim_start()),
            None => insert_before_close(&mut doc, &rendered)?,
        }
    }
    if !doc.ends_with('\n') {
        doc.push('\n');
    }
    Ok(doc)
}

/// Documento con un `<configuration>` abierto y cerrado donde insertar.
fn open_root(content: &str) -> String {
    let comments = comment_spans(content);
    let Some(open) = open_tags(content, "configuration")
        .into_iter()
        .find(|i| !in_comment(&comments, *i))
    else {
        return xml_skeleton(content);
    };

    let tag_end = content[open..]
        .find('>')
        .map(|i| open + i + 1)
        .unwrap_or(content.len());
    if content[..tag_end].ends_with("/>") {
        // <configuration/>
        let mut doc = content[..tag_end - 2].trim_end().to_string();
        doc.push_str(">\n");
        doc.push_str(XML_CLOSE);
        doc.push_str(&content[tag_end..]);
        return doc;
    }
    if close_position(content).is_none() {
        let mut doc = content.trim_end().to_string();
        doc.push('\n');
        doc.push_str(XML_CLOSE);
        doc.push('\n');
        return doc;
    }
    content.to_string()
}

// Fichero vacío o sin raíz: se envuelve lo que haya.
fn xml_skeleton(existing: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    if !existing.trim_start().starts_with("<?xml") {
        lines.push(XML_HEADER);
        lines.push(XML_STYLESHEET);
    }
    lines.extend(existing.lines().filter(|l| !l.trim().is_empty()));
    lines.push(XML_OPEN);
    lines.push(XML_CLOSE);
    let mut doc = lines.join("\n");
    doc.push('\n');
    doc
}

fn find_property(doc: &str, key: &str) -> Result<Option<Range<usize>>, MergeError> {
    let comments = comment_spans(doc);
    for start in open_tags(doc, "property") {
        if in_comment(&comments, start) {
            continue;
        }
        let tag_end = doc[start..].find('>').map(|i| start + i);
        if tag_end.map_or(true, |e| doc[..e].ends_with('/')) {
            continue;
        }
        let end = doc[start..]
            .find(PROPERTY_CLOSE)
            .map(|i| start + i + PROPERTY_CLOSE.len())
            .ok_or(MergeError::UnclosedProperty(start))?;
        if property_name(&doc[start..end]) == Some(key) {
            return Ok(Some(start..end));
        }
    }
    Ok(None)
}

fn property_name(element: &str) -> Option<&str> {
    let from = element.find("<name>")? + "<name>".len();
    let to = from + element[from..].find("</name>")?;
    Some(element[from..to].trim())
}

fn insert_before_close(doc: &mut String, line: &str) -> Result<(), MergeError> {
    let at = close_position(doc).ok_or(MergeError::MissingRoot)?;
    let line_start = doc[..at].rfind('\n').map(|i| i + 1).unwrap_or(0);
    if doc[line_start..at].trim().is_empty() {
        doc.insert_str(line_start, &format!("{}\n", line));
    } else {
        doc.insert_str(at, &format!("\n{}\n", line));
    }
    Ok(())
}

/// Posiciones de `<name` seguidas de `>`, `/` o espacio.
fn open_tags(doc: &str, name: &str) -> Vec<usize> {
    let pattern = format!("<{}", name);
    doc.match_indices(pattern.as_str())
        .map(|(i, _)| i)
        .filter(|i| {
            doc[i + pattern.len()..]
                .chars()
                .next()
                .map_or(false, |c| c == '>' || c == '/' || c.is_whitespace())
        })
        .collect()
}

fn close_position(doc: &str) -> Option<usize> {
    let comments = comment_spans(doc);
    doc.rmatch_indices(XML_CLOSE)
        .map(|(i, _)| i)
        .find(|i| !in_comment(&comments, *i))
}

fn comment_spans(doc: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut from = 0;
    while let Some(start) = doc[from..].find("<!--").map(|i| from + i) {
        let end = doc[start + 4..]
            .find("-->")
            .map(|i| start + 4 + i + 3)
            .unwrap_or(doc.len());
        spans.push(start..end);
        from = end;
    }
    spans
}

fn in_comment(spans: &[Range<usize>], pos: usize) -> bool {
    spans.iter().any(|s| s.contains(&pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn replaces_existing_key_in_place() {
        let before = "tickTime = 1000\ndataDir = /tmp/zk\nclientPort = 2181\n";
        let after = upsert(before, &props(&[("dataDir", "/HA/data/zookeeper")]), LineFormat::KeyValue).unwrap();

        assert_eq!(
            after,
            "tickTime = 1000\ndataDir = /HA/data/zookeeper\nclientPort = 2181\n"
        );
        assert_eq!(before.lines().count(), after.lines().count());
    }

    #[test]
    fn appends_new_keys_one_line_each() {
        let before = "tickTime = 2000\n";
        let after = upsert(
            before,
            &props(&[("initLimit", "10"), ("tickTime", "2000"), ("syncLimit", "5")]),
            LineFormat::KeyValue,
        )
        .unwrap();
        assert_eq!(after.lines().count(), before.lines().count() + 2);
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let p = props(&[("JAVA_HOME", "/usr/lib/jvm/java-8"), ("HADOOP_HOME", "/opt/hadoop")]);
        let once = upsert("", &p, LineFormat::Export).unwrap();
        let twice = upsert(&once, &p, LineFormat::Export).unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.matches("export JAVA_HOME=").count(), 1);
    }

    #[test]
    fn comments_are_never_treated_as_definitions() {
        let before = "# dataDir = /old\n";
        let after = upsert(before, &props(&[("dataDir", "/new")]), LineFormat::KeyValue).unwrap();
        assert_eq!(after, "# dataDir = /old\ndataDir = /new\n");
    }

    #[test]
    fn export_matching_requires_exact_variable_name() {
        let before = "export HADOOP_PREFIX=/opt/h\nexport HADOOP=/x\n";
        let after = upsert(before, &props(&[("HADOOP", "/y")]), LineFormat::Export).unwrap();
        assert_eq!(after, "export HADOOP_PREFIX=/opt/h\nexport HADOOP=\"/y\"\n");
    }

    #[test]
    fn export_values_are_double_quoted() {
        let after = upsert(
            "",
            &props(&[
                ("HADOOP_OPTS", "-Djava.library.path=/opt/h/lib/native -Dx=\"y\""),
                ("PATH", "/opt/h/bin:$PATH"),
            ]),
            LineFormat::Export,
        )
        .unwrap();
        assert_eq!(
            after,
            "export HADOOP_OPTS=\"-Djava.library.path=/opt/h/lib/native -Dx=\\\"y\\\"\"\n\
             export PATH=\"/opt/h/bin:$PATH\"\n"
        );
    }

    #[test]
    fn hosts_lines_are_keyed_by_ip() {
        let before = "127.0.0.1 localhost\n10.0.0.5 viejo\n";
        let after = upsert(
            before,
            &props(&[("10.0.0.5", "nodo-b"), ("10.0.0.6", "nodo-c")]),
            LineFormat::Hosts,
        )
        .unwrap();
        assert_eq!(after, "127.0.0.1 localhost\n10.0.0.5 nodo-b\n10.0.0.6 nodo-c\n");
    }

    #[test]
    fn xml_skeleton_is_created_for_empty_file() {
        let after = upsert("", &props(&[("fs.defaultFS", "hdfs://c/")]), LineFormat::HadoopXml).unwrap();
        let lines: Vec<&str> = after.lines().collect();

        assert_eq!(lines[0], XML_HEADER);
        assert_eq!(lines[2], XML_OPEN);
        assert_eq!(
            lines[3],
            "  <property><name>fs.defaultFS</name><value>hdfs://c/</value></property>"
        );
        assert_eq!(lines[4], XML_CLOSE);
    }

    #[test]
    fn xml_new_properties_go_before_closing_tag() {
        let first = upsert("", &props(&[("a", "1")]), LineFormat::HadoopXml).unwrap();
        let second = upsert(&first, &props(&[("b", "2"), ("a", "3")]), LineFormat::HadoopXml).unwrap();

        let lines: Vec<&str> = second.lines().collect();
        assert_eq!(lines.last(), Some(&XML_CLOSE));
        assert!(lines[3].contains("<name>a</name><value>3</value>"));
        assert!(lines[4].contains("<name>b</name><value>2</value>"));
        assert_eq!(first.lines().count() + 1, second.lines().count());
    }

    #[test]
    fn xml_one_line_root_gets_a_single_configuration() {
        let before = "<?xml version=\"1.0\"?>\n<configuration></configuration>\n";
        let after = upsert(before, &props(&[("a", "1"), ("b", "2")]), LineFormat::HadoopXml).unwrap();

        assert_eq!(after.matches("<configuration").count(), 1);
        assert_eq!(
            after,
            "<?xml version=\"1.0\"?>\n<configuration>\n\
             \x20 <property><name>a</name><value>1</value></property>\n\
             \x20 <property><name>b</name><value>2</value></property>\n\
             </configuration>\n"
        );
    }

    #[test]
    fn xml_self_closed_root_is_opened() {
        let after = upsert("<configuration/>", &props(&[("a", "1")]), LineFormat::HadoopXml).unwrap();
        assert_eq!(
            after,
            "<configuration>\n  <property><name>a</name><value>1</value></property>\n</configuration>\n"
        );
    }

    #[test]
    fn xml_multi_line_property_is_replaced_whole() {
        let before = "<configuration>\n\
                      \x20 <property>\n\
                      \x20   <name>a</name>\n\
                      \x20   <value>old</value>\n\
                      \x20   <description>x</description>\n\
                      \x20 </property>\n\
                      \x20 <property>\n\
                      \x20   <name>b</name>\n\
                      \x20   <value>keep</value>\n\
                      \x20 </property>\n\
                      </configuration>\n";
        let after = upsert(before, &props(&[("a", "new")]), LineFormat::HadoopXml).unwrap();

        assert!(!after.contains("old"));
        assert_eq!(after.matches("<property>").count(), 2);
        assert!(after.contains("  <property><name>a</name><value>new</value></property>\n  <property>\n"));
        assert!(after.contains("<value>keep</value>"));
        assert_eq!(upsert(&after, &props(&[("a", "new")]), LineFormat::HadoopXml).unwrap(), after);
    }

    #[test]
    fn xml_commented_properties_are_ignored() {
        let before = "<configuration>\n<!-- <property><name>a</name><value>0</value></property> -->\n</configuration>\n";
        let after = upsert(before, &props(&[("a", "1")]), LineFormat::HadoopXml).unwrap();
        assert!(after.contains("<!-- <property><name>a</name><value>0</value></property> -->"));
        assert!(after.contains("  <property><name>a</name><value>1</value></property>\n</configuration>"));
    }

    #[test]
    fn xml_unclosed_property_is_an_error() {
        let before = "<configuration>\n<property><name>a</name>\n</configuration>\n";
        let err = upsert(before, &props(&[("a", "1")]), LineFormat::HadoopXml).unwrap_err();
        assert!(matches!(err, MergeError::UnclosedProperty(_)));
    }

    #[test]
    fn format_round_trips_through_its_cli_name() {
        for f in [
            LineFormat::KeyValue,
            LineFormat::HadoopXml,
            LineFormat::Export,
            LineFormat::Hosts,
        ] {
            assert_eq!(f.as_str().parse::<LineFormat>(), Ok(f));
        }
        assert!("ini".parse::<LineFormat>().is_err());
    }
}
