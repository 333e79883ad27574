use anyhow::{bail, Result as AnyResult};
use glam::Mat4;
use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};

use super::egl::{EglContext, EglImage};
use super::{Gpu, TextureId};
use crate::capture::CapturedFrame;
use crate::encoder::SharingContext;
use crate::error::{Error, Result};
use crate::transform::Viewport;

/// GL_TEXTURE_EXTERNAL_OES, not part of the core GLES2 bindings.
pub const TEXTURE_EXTERNAL_OES: u32 = 0x8D65;

const VERTEX_SHADER: &str = r#"#version 100
uniform mat4 uMVPMatrix;
uniform mat4 uTexMatrix;
attribute vec4 aPosition;
attribute vec4 aTextureCoord;
varying vec2 vTextureCoord;
void main() {
    gl_Position = uMVPMatrix * aPosition;
    vTextureCoord = (uTexMatrix * aTextureCoord).xy;
}
"#;

const FRAGMENT_SHADER: &str = r#"#version 100
#extension GL_OES_EGL_image_external : require
precision mediump float;
varying vec2 vTextureCoord;
uniform samplerExternalOES sTexture;
void main() {
    gl_FragColor = texture2D(sTexture, vTextureCoord);
}
"#;

// Full screen quad as a triangle strip: x, y, u, v
#[rustfmt::skip]
const QUAD: [f32; 16] = [
    -1.0, -1.0, 0.0, 0.0,
     1.0, -1.0, 1.0, 0.0,
    -1.0,  1.0, 0.0, 1.0,
     1.0,  1.0, 1.0, 1.0,
];

struct Drawer {
    program: u32,
    vbo: u32,
    a_position: u32,
    a_texcoord: u32,
    u_mvp: i32,
    u_tex_matrix: i32,
    s_texture: i32,
}

/// GLES2 implementation of [`Gpu`] on top of an EGL context. All calls must
/// happen on the thread where the context is current.
pub struct GlesGpu {
    egl: EglContext,
    drawer: Option<Drawer>,
    images: HashMap<TextureId, EglImage>,
}

impl GlesGpu {
    /// Wraps `egl`, whose context must already be current.
    pub fn new(egl: EglContext) -> Self {
        egl.load_gl();
        Self {
            egl,
            drawer: None,
            images: HashMap::new(),
        }
    }

    pub fn egl(&self) -> &EglContext {
        &self.egl
    }

    /// Imports `frame` and attaches it to `texture`, replacing the image that
    /// was attached before.
    pub fn import_dmabuf(&mut self, texture: TextureId, frame: &CapturedFrame) -> AnyResult<()> {
        let image = self.egl.create_dmabuf_image(frame)?;
        unsafe {
            gl::BindTexture(TEXTURE_EXTERNAL_OES, texture.0);
        }
        self.egl.bind_image(TEXTURE_EXTERNAL_OES, &image);
        unsafe {
            gl::BindTexture(TEXTURE_EXTERNAL_OES, 0);
        }
        if let Some(previous) = self.images.insert(texture, image) {
            self.egl.destroy_image(previous);
        }
        Ok(())
    }

    fn build_drawer() -> AnyResult<Drawer> {
        unsafe {
            let vs = compile_shader(gl::VERTEX_SHADER, VERTEX_SHADER)?;
            let fs = match compile_shader(gl::FRAGMENT_SHADER, FRAGMENT_SHADER) {
                Ok(fs) => fs,
                Err(e) => {
                    gl::DeleteShader(vs);
                    return Err(e);
                }
            };

            let program = gl::CreateProgram();
            gl::AttachShader(program, vs);
            gl::AttachShader(program, fs);
            gl::LinkProgram(program);
            gl::DeleteShader(vs);
            gl::DeleteShader(fs);

            let mut status = 0;
            gl::GetProgramiv(program, gl::LINK_STATUS, &mut status);
            if status == 0 {
                let log = program_log(program);
                gl::DeleteProgram(program);
                bail!("Failed to link shader program: {log}");
            }

            let a_position = gl::GetAttribLocation(program, c"aPosition".as_ptr());
            let a_texcoord = gl::GetAttribLocation(program, c"aTextureCoord".as_ptr());
            if a_position < 0 || a_texcoord < 0 {
                gl::DeleteProgram(program);
                bail!("Shader program is missing vertex attributes");
            }

            let mut vbo = 0;
            gl::GenBuffers(1, &mut vbo);
            gl::BindBuffer(gl::ARRAY_BUFFER, vbo);
            gl::BufferData(
                gl::ARRAY_BUFFER,
                std::mem::size_of_val(&QUAD) as isize,
                QUAD.as_ptr() as *const c_void,
                gl::STATIC_DRAW,
            );
            gl::BindBuffer(gl::ARRAY_BUFFER, 0);

            Ok(Drawer {
                program,
                vbo,
                a_position: a_position as u32,
                a_texcoord: a_texcoord as u32,
                u_mvp: gl::GetUniformLocation(program, c"uMVPMatrix".as_ptr()),
                u_tex_matrix: gl::GetUniformLocation(program, c"uTexMatrix".as_ptr()),
                s_texture: gl::GetUniformLocation(program, c"sTexture".as_ptr()),
            })
        }
    }
}

unsafe fn compile_shader(shader_type: u32, source: &str) -> AnyResult<u32> {
    let shader = gl::CreateShader(shader_type);
    let source_ptr = source.as_ptr() as *const gl::types::GLchar;
    let source_len = source.len() as i32;
    gl::ShaderSource(shader, 1, &source_ptr, &source_len);
    gl::CompileShader(shader);

    let mut status = 0;
    gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut status);
    if status == 0 {
        let mut len = 0;
        gl::GetShaderiv(shader, gl::INFO_LOG_LENGTH, &mut len);
        let mut buf = vec![0u8; len.max(1) as usize];
        gl::GetShaderInfoLog(
            shader,
            len,
            std::ptr::null_mut(),
            buf.as_mut_ptr() as *mut gl::types::GLchar,
        );
        gl::DeleteShader(shader);
        bail!("Shader compile error: {}", String::from_utf8_lossy(&buf));
    }

    Ok(shader)
}

unsafe fn program_log(program: u32) -> String {
    let mut len = 0;
    gl::GetProgramiv(program, gl::INFO_LOG_LENGTH, &mut len);
    let mut buf = vec![0u8; len.max(1) as usize];
    gl::GetProgramInfoLog(
        program,
        len,
        std::ptr::null_mut(),
        buf.as_mut_ptr() as *mut gl::types::GLchar,
    );
    String::from_utf8_lossy(&buf).into_owned()
}

impl Gpu for GlesGpu {
    fn extensions(&self) -> String {
        unsafe {
            let ptr = gl::GetString(gl::EXTENSIONS);
            if ptr.is_null() {
                return String::new();
            }
            CStr::from_ptr(ptr as *const c_char)
                .to_string_lossy()
                .into_owned()
        }
    }

    fn create_external_texture(&mut self) -> Result<TextureId> {
        let mut texture = 0;
        unsafe {
            gl::GenTextures(1, &mut texture);
            if texture == 0 {
                return Err(Error::Texture("glGenTextures returned no name".into()));
            }
            gl::BindTexture(TEXTURE_EXTERNAL_OES, texture);
            gl::TexParameteri(TEXTURE_EXTERNAL_OES, gl::TEXTURE_MIN_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(TEXTURE_EXTERNAL_OES, gl::TEXTURE_MAG_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(
                TEXTURE_EXTERNAL_OES,
                gl::TEXTURE_WRAP_S,
                gl::CLAMP_TO_EDGE as i32,
            );
            gl::TexParameteri(
                TEXTURE_EXTERNAL_OES,
                gl::TEXTURE_WRAP_T,
                gl::CLAMP_TO_EDGE as i32,
            );
            gl::BindTexture(TEXTURE_EXTERNAL_OES, 0);

            let err = gl::GetError();
            if err != gl::NO_ERROR {
                gl::DeleteTextures(1, &texture);
                return Err(Error::Texture(format!("GL error 0x{err:x}")));
            }
        }
        Ok(TextureId(texture))
    }

    fn delete_texture(&mut self, texture: TextureId) {
        if let Some(image) = self.images.remove(&texture) {
            self.egl.destroy_image(image);
        }
        unsafe { gl::DeleteTextures(1, &texture.0) };
    }

    fn init_drawer(&mut self) -> Result<()> {
        let drawer = Self::build_drawer().map_err(|e| Error::Drawer(format!("{e:#}")))?;
        if let Some(old) = self.drawer.replace(drawer) {
            unsafe {
                gl::DeleteProgram(old.program);
                gl::DeleteBuffers(1, &old.vbo);
            }
        }
        Ok(())
    }

    fn release_drawer(&mut self) {
        if let Some(drawer) = self.drawer.take() {
            unsafe {
                gl::DeleteProgram(drawer.program);
                gl::DeleteBuffers(1, &drawer.vbo);
            }
        }
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        unsafe { gl::ClearColor(rgba[0], rgba[1], rgba[2], rgba[3]) };
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        unsafe { gl::Viewport(viewport.x, viewport.y, viewport.width, viewport.height) };
    }

    fn clear(&mut self) {
        unsafe { gl::Clear(gl::COLOR_BUFFER_BIT) };
    }

    fn draw(&mut self, texture: TextureId, sampling: &Mat4, mvp: &Mat4) {
        let Some(d) = &self.drawer else {
            return;
        };
        let stride = (4 * std::mem::size_of::<f32>()) as i32;
        unsafe {
            gl::UseProgram(d.program);
            gl::BindBuffer(gl::ARRAY_BUFFER, d.vbo);

            gl::EnableVertexAttribArray(d.a_position);
            gl::VertexAttribPointer(d.a_position, 2, gl::FLOAT, gl::FALSE, stride, std::ptr::null());
            gl::EnableVertexAttribArray(d.a_texcoord);
            gl::VertexAttribPointer(
                d.a_texcoord,
                2,
                gl::FLOAT,
                gl::FALSE,
                stride,
                (2 * std::mem::size_of::<f32>()) as *const c_void,
            );

            gl::ActiveTexture(gl::TEXTURE0);
            gl::BindTexture(TEXTURE_EXTERNAL_OES, texture.0);
            gl::Uniform1i(d.s_texture, 0);
            gl::UniformMatrix4fv(d.u_mvp, 1, gl::FALSE, mvp.to_cols_array().as_ptr());
            gl::UniformMatrix4fv(d.u_tex_matrix, 1, gl::FALSE, sampling.to_cols_array().as_ptr());

            gl::DrawArrays(gl::TRIANGLE_STRIP, 0, 4);

            gl::DisableVertexAttribArray(d.a_position);
            gl::DisableVertexAttribArray(d.a_texcoord);
            gl::BindTexture(TEXTURE_EXTERNAL_OES, 0);
            gl::BindBuffer(gl::ARRAY_BUFFER, 0);
            gl::UseProgram(0);
        }
    }

    fn sharing_context(&self) -> SharingContext {
        SharingContext::from_ptr(self.egl.context.as_ptr())
    }
}

impl Drop for GlesGpu {
    fn drop(&mut self) {
        for (_, image) in self.images.drain() {
            self.egl.destroy_image(image);
        }
    }
}
