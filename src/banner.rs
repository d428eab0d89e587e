pub const SITE_NAME: &str = "RSG Mobile Mechanics";
pub const SHUTDOWN: &str = "\n👋 Server stopped";

/// Startup text, printed once the port is bound.
pub fn banner(port: u16) -> String {
    let url = format!("http://localhost:{port}");
    format!(
        "🚀 {SITE_NAME} Test Server\n\
         📱 Open your browser and go to: {url}\n\
         🔧 Press Ctrl+C to stop the server\n\
         \n\
         📋 Testing Instructions:\n   \
         1. Open {url} in your browser\n   \
         2. Open Developer Tools (F12)\n   \
         3. Click the device icon to simulate mobile\n   \
         4. Select iPhone XR or similar device\n   \
         5. Test the mobile menu (hamburger icon)\n\
         \n"
    )
}
