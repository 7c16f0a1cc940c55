//! Static level geometry import
//!
//! Level geometry is OBJ text behind a two-line header. `tobj` does the
//! parsing and fans polygons into triangles. Before handing the text over,
//! each line is checked for what the level format adds on top of OBJ: every
//! coordinate must be finite, and a face may only refer to vertices that
//! appear above it. Vertices are given in host coordinates.

use crate::physics::body::{Activation, BodyCreationSettings, BodyHandle};
use crate::physics::error::MeshImportError;
use crate::physics::shapes::{PhysicsMaterial, Shape, SharedShape, TriangleMesh};
use crate::physics::units::to_physics;
use crate::physics::world::PhysicsWorld;
use glam::{Quat, Vec3};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info};

/// Header lines preceding the geometry
const HEADER_LINES: usize = 2;

/// Parse mesh text; vertices are converted to simulation space
pub fn parse_mesh<R: BufRead>(reader: R) -> Result<TriangleMesh, MeshImportError> {
    let mut geometry = String::new();
    let mut vertex_count = 0;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if index < HEADER_LINES {
            continue;
        }
        check_line(&line, index + 1, &mut vertex_count)?;
        geometry.push_str(&line);
        geometry.push('\n');
    }

    let (models, _materials) = tobj::load_obj_buf(
        &mut geometry.as_bytes(),
        &tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        },
        |_| Err(tobj::LoadError::OpenFileFailed),
    )?;

    let mut vertices: Vec<Vec3> = Vec::new();
    let mut triangles: Vec<[u32; 3]> = Vec::new();
    for model in &models {
        let offset = vertices.len() as u32;
        vertices.extend(
            model
                .mesh
                .positions
                .chunks_exact(3)
                .map(|p| to_physics(Vec3::new(p[0], p[1], p[2]))),
        );
        triangles.extend(
            model
                .mesh
                .indices
                .chunks_exact(3)
                .map(|t| [offset + t[0], offset + t[1], offset + t[2]]),
        );
    }

    if triangles.is_empty() {
        return Err(MeshImportError::Empty);
    }

    debug!(
        models = models.len(),
        vertices = vertices.len(),
        triangles = triangles.len(),
        "Parsed mesh"
    );
    Ok(TriangleMesh::new(vertices, triangles))
}

fn malformed(line: usize, reason: String) -> MeshImportError {
    MeshImportError::Malformed { line, reason }
}

/// Validate one geometry line, counting vertices as they appear
fn check_line(line: &str, line_number: usize, vertex_count: &mut usize) -> Result<(), MeshImportError> {
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some("v") => {
            for _ in 0..3 {
                let token = tokens.next().ok_or_else(|| {
                    malformed(line_number, "vertex needs three coordinates".to_string())
                })?;
                let coord: f32 = token.parse().map_err(|_| {
                    malformed(line_number, format!("invalid coordinate '{token}'"))
                })?;
                // Overflowing literals such as 1e39 parse to infinity
                if !coord.is_finite() {
                    return Err(malformed(
                        line_number,
                        format!("non-finite coordinate '{token}'"),
                    ));
                }
            }
            *vertex_count += 1;
        }
        Some("f") => {
            let mut corners = 0;
            for token in tokens {
                check_index(token, line_number, *vertex_count)?;
                corners += 1;
            }
            if corners < 3 {
                return Err(malformed(
                    line_number,
                    format!("face needs at least three indices, got {corners}"),
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Check a face token's vertex index against the vertices read so far
///
/// Positive indices are 1-based; negative ones count back from the last vertex.
fn check_index(token: &str, line: usize, vertex_count: usize) -> Result<(), MeshImportError> {
    let leading = token.split('/').next().unwrap_or(token);
    let index: i64 = leading
        .parse()
        .map_err(|_| malformed(line, format!("invalid vertex index '{token}'")))?;

    let in_range = if index > 0 {
        index as usize <= vertex_count
    } else {
        index != 0 && index.unsigned_abs() as usize <= vertex_count
    };
    if !in_range {
        return Err(MeshImportError::IndexOutOfRange {
            line,
            index,
            vertex_count,
        });
    }
    Ok(())
}

/// Read and parse a mesh file
pub fn load_mesh(path: &Path) -> Result<TriangleMesh, MeshImportError> {
    let file = File::open(path)?;
    parse_mesh(BufReader::new(file))
}

impl PhysicsWorld {
    /// Import a mesh file as one static body at the origin
    ///
    /// The broad phase is optimized afterwards. On any error the world is
    /// left exactly as it was.
    pub fn import_static_mesh(
        &mut self,
        path: impl AsRef<Path>,
    ) -> Result<(BodyHandle, SharedShape), MeshImportError> {
        let path = path.as_ref();
        let mesh = load_mesh(path)?;
        let (vertices, triangles) = (mesh.vertex_count(), mesh.triangle_count());

        let shape = Shape::triangle_mesh(mesh);
        let material = PhysicsMaterial::new(
            self.config().default_friction,
            self.config().default_restitution,
        );
        let settings = BodyCreationSettings::fixed(shape.clone(), Vec3::ZERO, Quat::IDENTITY)
            .with_material(material);
        let body = self.create_and_add_body(&settings, Activation::DontActivate)?;
        self.optimize_broad_phase();

        info!(path = %path.display(), vertices, triangles, "Imported static mesh");
        Ok((body, shape))
    }
}
