//! SDL2 window sink.
//! Streams RGBA frames into a texture sized to the shared resource.

use color_eyre::{eyre::eyre, Result};
use sdl2::event::Event;
use sdl2::keyboard::Keycode;
use sdl2::pixels::PixelFormatEnum;
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};
use sdl2::EventPump;
use tracing::info;

use crate::display::FrameSink;
use crate::media::{convert, Frame};

pub struct Sdl2Sink {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
    event_pump: EventPump,
    width: u32,
    height: u32,
    closed: bool,
    _sdl: sdl2::Sdl,
}

impl Sdl2Sink {
    pub fn new(title: &str, width: u32, height: u32) -> Result<Self> {
        let sdl = sdl2::init().map_err(|e| eyre!(e))?;
        let video_subsystem = sdl.video().map_err(|e| eyre!(e))?;

        let window = video_subsystem
            .window(title, width, height)
            .position_centered()
            .resizable()
            .build()?;

        let canvas = window.into_canvas().present_vsync().build()?;
        let texture_creator = canvas.texture_creator();
        let event_pump = sdl.event_pump().map_err(|e| eyre!(e))?;

        info!("Opened {}x{} window", width, height);

        Ok(Self {
            canvas,
            texture_creator,
            event_pump,
            width,
            height,
            closed: false,
            _sdl: sdl,
        })
    }
}

impl FrameSink for Sdl2Sink {
    fn present(&mut self, frame: &Frame) -> Result<()> {
        if (frame.width(), frame.height()) != (self.width, self.height) {
            return Err(eyre!(
                "Frame is {}x{}, window texture is {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            ));
        }
        let rgba = convert::to_packed(frame, 4)?;

        // ABGR8888 is byte order R, G, B, A on little-endian
        let mut texture = self
            .texture_creator
            .create_texture_streaming(PixelFormatEnum::ABGR8888, self.width, self.height)
            .map_err(|e| eyre!(e))?;
        texture
            .update(None, &rgba, (self.width * 4) as usize)
            .map_err(|e| eyre!(e))?;

        self.canvas.clear();
        self.canvas
            .copy(&texture, None, None)
            .map_err(|e| eyre!(e))?;
        self.canvas.present();
        Ok(())
    }

    fn should_close(&mut self) -> bool {
        for event in self.event_pump.poll_iter() {
            match event {
                Event::Quit { .. }
                | Event::KeyDown {
                    keycode: Some(Keycode::Escape),
                    ..
                } => {
                    info!("Quit event received");
                    self.closed = true;
                }
                _ => {}
            }
        }
        self.closed
    }

    fn is_interactive(&self) -> bool {
        true
    }
}
