//! Host object model. Only the model loop thread touches this.

use std::time::{SystemTime, UNIX_EPOCH};

/// A material in the model: plain color or textured.
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    pub color: Option<(u8, u8, u8)>,
    /// Texture size in meters (width, height), for image materials.
    pub texture_size_m: Option<(f64, f64)>,
}

/// A flat image component: one face carrying a textured material.
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub name: String,
    pub material_name: String,
    pub width_m: f64,
    pub height_m: f64,
}

/// The single-threaded object model the bridge mutates on behalf of clients.
pub struct Model {
    material_width_m: f64,
    materials: Vec<Material>,
    components: Vec<Component>,
}

impl Model {
    pub fn new(material_width_m: f64) -> Self {
        Self {
            material_width_m,
            materials: Vec::new(),
            components: Vec::new(),
        }
    }

    /// Create a color material named `Color_<hex>_<epoch>`. The hex part is
    /// derived from the channels when the request did not carry one.
    pub fn create_color_material(&mut self, r: u8, g: u8, b: u8, hex: Option<&str>) -> String {
        let hex = match hex {
            Some(h) => h.trim_start_matches('#').to_string(),
            None => format!("{r:02X}{g:02X}{b:02X}"),
        };
        let name = format!("Color_{}_{}", hex, epoch_secs());
        log::info!("created color material {name} ({r},{g},{b})");
        self.materials.push(Material {
            name: name.clone(),
            color: Some((r, g, b)),
            texture_size_m: None,
        });
        name
    }

    /// Create a textured material from PNG bytes, sized to the configured
    /// width with proportional height.
    pub fn create_image_material(&mut self, png: &[u8], image_id: &str) -> Result<String, String> {
        let (w, h) = png_dimensions(png).ok_or("could not read image dimensions")?;
        let aspect = f64::from(h) / f64::from(w);
        let name = format!("Image_Material_{}_{}", image_id, epoch_secs());
        log::info!("created image material {name} ({w}x{h}px)");
        self.materials.push(Material {
            name: name.clone(),
            color: None,
            texture_size_m: Some((self.material_width_m, self.material_width_m * aspect)),
        });
        Ok(name)
    }

    /// Create a flat component holding one textured face, plus its backing
    /// material named `<component>_Material`.
    pub fn create_image_component(&mut self, png: &[u8], image_id: &str) -> Result<String, String> {
        let (w, h) = png_dimensions(png).ok_or("could not read image dimensions")?;
        let aspect = f64::from(h) / f64::from(w);
        let width_m = self.material_width_m;
        let height_m = width_m * aspect;
        let name = format!("Image_Component_{}_{}", image_id, epoch_secs());
        let material_name = format!("{name}_Material");
        log::info!("created image component {name} ({w}x{h}px)");
        self.materials.push(Material {
            name: material_name.clone(),
            color: None,
            texture_size_m: Some((width_m, height_m)),
        });
        self.components.push(Component {
            name: name.clone(),
            material_name,
            width_m,
            height_m,
        });
        Ok(name)
    }

    pub fn materials(&self) -> &[Material] {
        &self.materials
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }
}

/// Read (width, height) from a PNG signature + IHDR chunk, or `None` if the
/// bytes are not a PNG.
pub fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    if bytes.len() < 24 || bytes[..8] != SIGNATURE {
        return None;
    }
    if &bytes[12..16] != b"IHDR" {
        return None;
    }
    let w = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let h = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    Some((w, h))
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Minimal PNG header (signature + IHDR) for the given dimensions. Enough for
/// `png_dimensions`; used by tests and nothing else.
#[cfg(test)]
pub fn test_png(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&13u32.to_be_bytes());
    bytes.extend_from_slice(b"IHDR");
    bytes.extend_from_slice(&width.to_be_bytes());
    bytes.extend_from_slice(&height.to_be_bytes());
    bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
    bytes
}
