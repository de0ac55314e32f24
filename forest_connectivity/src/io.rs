//! The ASCII connectivity file format.
//!
//! A newline-delimited text stream of bracketed sections. `#` starts a
//! line comment (stripped before tokenizing); all indices in the file are
//! 1-based and are converted to 0-based on read, and back on write.

use crate::Connectivity;
use std::collections::HashMap;
use std::fmt::Write as _;

/// Failure parsing or validating a connectivity file.
#[derive(Debug, thiserror::Error)]
pub enum ConnectivityError {
    #[error("missing required section [{0}]")]
    MissingSection(String),
    #[error("missing required key {0} in [Forest Info]")]
    MissingKey(String),
    #[error("malformed line in [{section}]: {line:?}")]
    Malformed { section: String, line: String },
    #[error("[{section}] declares {expected} rows but {actual} were found")]
    CountMismatch {
        section: String,
        expected: usize,
        actual: usize,
    },
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(i) => &line[..i],
        None => line,
    }
}

/// Splits `text` into named sections, each a list of non-empty,
/// comment-stripped data lines.
fn split_sections(text: &str) -> HashMap<String, Vec<String>> {
    let mut sections: HashMap<String, Vec<String>> = HashMap::new();
    let mut current: Option<String> = None;
    for raw in text.lines() {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            current = Some(name.trim().to_string());
            sections.entry(current.clone().unwrap()).or_default();
            continue;
        }
        if let Some(name) = &current {
            sections.get_mut(name).unwrap().push(line.to_string());
        }
    }
    sections
}

fn section<'a>(
    sections: &'a HashMap<String, Vec<String>>,
    name: &str,
) -> Result<&'a [String], ConnectivityError> {
    sections
        .get(name)
        .map(Vec::as_slice)
        .ok_or_else(|| ConnectivityError::MissingSection(name.to_string()))
}

pub(crate) fn read(text: &str) -> Result<Connectivity, ConnectivityError> {
    let sections = split_sections(text);

    let info = section(&sections, "Forest Info")?;
    let mut keys: HashMap<&str, &str> = HashMap::new();
    for line in info {
        let (k, v) = line
            .split_once('=')
            .ok_or_else(|| ConnectivityError::Malformed {
                section: "Forest Info".into(),
                line: line.clone(),
            })?;
        keys.insert(k.trim(), v.trim());
    }
    let get_usize = |key: &str| -> Result<usize, ConnectivityError> {
        keys.get(key)
            .ok_or_else(|| ConnectivityError::MissingKey(key.to_string()))?
            .parse::<usize>()
            .map_err(|_| ConnectivityError::Malformed {
                section: "Forest Info".into(),
                line: format!("{key} = {}", keys[key]),
            })
    };
    let num_trees = get_usize("Nk")?;
    let num_vertices = get_usize("Nv")?;

    let vertex_lines = section(&sections, "Coordinates of Element Vertices")?;
    if vertex_lines.len() != num_vertices {
        return Err(ConnectivityError::CountMismatch {
            section: "Coordinates of Element Vertices".into(),
            expected: num_vertices,
            actual: vertex_lines.len(),
        });
    }
    let mut vertices = vec![[0.0; 3]; num_vertices];
    for line in vertex_lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let malformed = || ConnectivityError::Malformed {
            section: "Coordinates of Element Vertices".into(),
            line: line.clone(),
        };
        if fields.len() != 4 {
            return Err(malformed());
        }
        let idx: usize = fields[0].parse().map_err(|_| malformed())?;
        let mut xyz = [0.0f64; 3];
        for i in 0..3 {
            xyz[i] = fields[i + 1].parse().map_err(|_| malformed())?;
        }
        vertices[idx - 1] = xyz;
    }

    let etv_lines = section(&sections, "Element to Vertex")?;
    let ete_lines = section(&sections, "Element to Element")?;
    let etf_lines = section(&sections, "Element to Face")?;
    for (name, lines) in [
        ("Element to Vertex", etv_lines),
        ("Element to Element", ete_lines),
        ("Element to Face", etf_lines),
    ] {
        if lines.len() != num_trees {
            return Err(ConnectivityError::CountMismatch {
                section: name.into(),
                expected: num_trees,
                actual: lines.len(),
            });
        }
    }

    let mut tree_to_vertex = vec![[0u32; 4]; num_trees];
    read_tree_table(etv_lines, "Element to Vertex", &mut tree_to_vertex)?;

    let mut tree_to_tree = vec![[0u32; 4]; num_trees];
    read_tree_table(ete_lines, "Element to Element", &mut tree_to_tree)?;

    let mut tree_to_face_u32 = vec![[0u32; 4]; num_trees];
    read_tree_table(etf_lines, "Element to Face", &mut tree_to_face_u32)?;
    let tree_to_face: Vec<[u8; 4]> = tree_to_face_u32
        .iter()
        .map(|row| [row[0] as u8, row[1] as u8, row[2] as u8, row[3] as u8])
        .collect();

    let vte_lines = section(&sections, "Vertex to Element")?;
    if vte_lines.len() != num_vertices {
        return Err(ConnectivityError::CountMismatch {
            section: "Vertex to Element".into(),
            expected: num_vertices,
            actual: vte_lines.len(),
        });
    }
    let mut per_vertex: Vec<Vec<u32>> = vec![Vec::new(); num_vertices];
    for line in vte_lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let malformed = || ConnectivityError::Malformed {
            section: "Vertex to Element".into(),
            line: line.clone(),
        };
        if fields.len() < 2 {
            return Err(malformed());
        }
        let idx: usize = fields[0].parse().map_err(|_| malformed())?;
        let count: usize = fields[1].parse().map_err(|_| malformed())?;
        if fields.len() != 2 + count {
            return Err(malformed());
        }
        let mut trees = Vec::with_capacity(count);
        for f in &fields[2..] {
            let t: u32 = f.parse().map_err(|_| malformed())?;
            trees.push(t - 1);
        }
        per_vertex[idx - 1] = trees;
    }
    let mut vtt_offset = Vec::with_capacity(num_vertices + 1);
    let mut vertex_to_tree = Vec::new();
    vtt_offset.push(0u32);
    for trees in &per_vertex {
        vertex_to_tree.extend_from_slice(trees);
        vtt_offset.push(vertex_to_tree.len() as u32);
    }

    Ok(Connectivity {
        num_trees,
        num_vertices,
        vertices,
        tree_to_vertex,
        tree_to_tree,
        tree_to_face,
        vtt_offset,
        vertex_to_tree,
    })
}

fn read_tree_table(
    lines: &[String],
    section_name: &str,
    out: &mut [[u32; 4]],
) -> Result<(), ConnectivityError> {
    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let malformed = || ConnectivityError::Malformed {
            section: section_name.to_string(),
            line: line.clone(),
        };
        if fields.len() != 5 {
            return Err(malformed());
        }
        let idx: usize = fields[0].parse().map_err(|_| malformed())?;
        let mut row = [0u32; 4];
        for i in 0..4 {
            let v: u32 = fields[i + 1].parse().map_err(|_| malformed())?;
            row[i] = v - 1;
        }
        out[idx - 1] = row;
    }
    Ok(())
}

pub(crate) fn write(conn: &Connectivity) -> String {
    let mut out = String::new();
    let vte: usize = conn.vertex_to_tree.len();
    writeln!(out, "[Forest Info]").unwrap();
    writeln!(out, "ver = 0.0.1").unwrap();
    writeln!(out, "Nk = {}", conn.num_trees).unwrap();
    writeln!(out, "Nv = {}", conn.num_vertices).unwrap();
    writeln!(out, "Nve = {vte}").unwrap();
    writeln!(out, "Net = 0").unwrap();
    writeln!(out, "Nft = 0").unwrap();
    writeln!(out, "Ncf = 0").unwrap();
    writeln!(out, "Nct = 0").unwrap();
    writeln!(out).unwrap();

    writeln!(out, "[Coordinates of Element Vertices]").unwrap();
    for (i, v) in conn.vertices.iter().enumerate() {
        writeln!(out, "{} {:.11e} {:.11e} {:.11e}", i + 1, v[0], v[1], v[2]).unwrap();
    }
    writeln!(out).unwrap();

    writeln!(out, "[Element to Vertex]").unwrap();
    for (i, row) in conn.tree_to_vertex.iter().enumerate() {
        writeln!(
            out,
            "{} {} {} {} {}",
            i + 1,
            row[0] + 1,
            row[1] + 1,
            row[2] + 1,
            row[3] + 1
        )
        .unwrap();
    }
    writeln!(out).unwrap();

    writeln!(out, "[Element to Element]").unwrap();
    for (i, row) in conn.tree_to_tree.iter().enumerate() {
        writeln!(
            out,
            "{} {} {} {} {}",
            i + 1,
            row[0] + 1,
            row[1] + 1,
            row[2] + 1,
            row[3] + 1
        )
        .unwrap();
    }
    writeln!(out).unwrap();

    writeln!(out, "[Element to Face]").unwrap();
    for (i, row) in conn.tree_to_face.iter().enumerate() {
        writeln!(
            out,
            "{} {} {} {} {}",
            i + 1,
            row[0] + 1,
            row[1] + 1,
            row[2] + 1,
            row[3] + 1
        )
        .unwrap();
    }
    writeln!(out).unwrap();

    writeln!(out, "[Vertex to Element]").unwrap();
    for v in 0..conn.num_vertices {
        let lo = conn.vtt_offset[v] as usize;
        let hi = conn.vtt_offset[v + 1] as usize;
        let trees = &conn.vertex_to_tree[lo..hi];
        write!(out, "{} {}", v + 1, trees.len()).unwrap();
        for t in trees {
            write!(out, " {}", t + 1).unwrap();
        }
        writeln!(out).unwrap();
    }
    writeln!(out, "[Vertex to Vertex]").unwrap();
    writeln!(out, "[Element Tags]").unwrap();
    writeln!(out, "[Face Tags]").unwrap();
    writeln!(out, "[Curved Faces]").unwrap();
    writeln!(out, "[Curved Types]").unwrap();
    out
}
